//! Softphone controller
//!
//! [`Softphone`] is the single surface a UI talks to. It wires the device
//! manager and the call state machine to one notification dispatcher: every
//! SDK notification is tagged with its device generation, queued, and
//! applied in arrival order by one task, so transitions never interleave.
//! The dispatcher never awaits the call-log store; record writes run in
//! their own tasks.
//!
//! ```text
//!  SDK callbacks ──► NotificationSink ──► mpsc queue ──► dispatcher
//!                                                         │
//!                                     normalize + generation check
//!                                          │              │
//!                                   DeviceManager    CallMachine
//!                                          │              │
//!                                   watch / broadcast / event feed ──► UI
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::call::CallStatus;
use crate::call_log::{CallLogBridge, CallLogStore};
use crate::client::calls::CallMachine;
use crate::client::recovery::RetryConfig;
use crate::client::state::{ControllerState, Diagnostics};
use crate::client::ClientConfig;
use crate::device::{ConnectionStatus, DeviceManager};
use crate::error::ClientResult;
use crate::events::ClientEvent;
use crate::feed::{EventEntry, EventFeed};
use crate::normalize::{normalize, NormalizedEvent};
use crate::sdk::{DeviceFactory, Envelope, VoiceDevice};
use crate::token::TokenProvider;

/// Call session controller for one softphone user
pub struct Softphone {
    config: Arc<ClientConfig>,
    diagnostics: Arc<Diagnostics>,
    device: Arc<DeviceManager>,
    calls: Arc<CallMachine>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Softphone {
    /// Wire up a controller and start its dispatcher. Requires a Tokio runtime.
    pub fn new(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        factory: Arc<dyn DeviceFactory>,
        store: Arc<dyn CallLogStore>,
    ) -> ClientResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let feed = Arc::new(EventFeed::new(config.event_feed_capacity));
        let diagnostics = Arc::new(Diagnostics::new(feed.clone()));
        let retry = RetryConfig::quick().with_max_attempts(config.persistence_retry_attempts);
        let call_log = Arc::new(CallLogBridge::new(store, feed, retry, config.persistence_timeout()));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let device = Arc::new(DeviceManager::new(
            config.clone(),
            tokens,
            factory,
            diagnostics.clone(),
            notify_tx,
        ));
        let calls = Arc::new(CallMachine::new(config.clone(), diagnostics.clone(), call_log));

        let dispatcher = tokio::spawn(dispatch(notify_rx, device.clone(), calls.clone()));
        info!(token_url = %config.token_url, "Softphone controller started");

        Ok(Arc::new(Self {
            config,
            diagnostics,
            device,
            calls,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<DeviceManager> {
        &self.device
    }

    pub fn calls(&self) -> &Arc<CallMachine> {
        &self.calls
    }

    // ===== DEVICE =====

    /// Bring up a registered device for `identity`
    pub async fn initialize(&self, identity: &str) -> ClientResult<Arc<dyn VoiceDevice>> {
        self.device.initialize(identity).await
    }

    /// Sign out: end any call, destroy the device, detach its listeners
    pub async fn reset(&self) {
        self.calls.abandon("device reset");
        self.device.reset();
    }

    // ===== CALLS =====

    pub async fn make_call(&self, to: &str) -> ClientResult<()> {
        let device = self.device.ready_device()?;
        self.calls.make_call(device, to).await
    }

    pub async fn accept(&self) -> ClientResult<()> {
        self.calls.accept().await
    }

    pub async fn reject(&self, reason: Option<&str>) -> ClientResult<()> {
        self.calls.reject(reason).await
    }

    pub async fn hang_up(&self) -> ClientResult<()> {
        self.calls.hang_up().await
    }

    pub async fn toggle_mute(&self) -> ClientResult<bool> {
        self.calls.toggle_mute().await
    }

    pub async fn toggle_hold(&self) -> ClientResult<bool> {
        self.calls.toggle_hold().await
    }

    pub async fn send_digits(&self, digits: &str) -> bool {
        self.calls.send_digits(digits).await
    }

    pub fn set_note(&self, text: &str) {
        self.calls.set_note(text);
    }

    // ===== OBSERVATION =====

    pub fn state(&self) -> ControllerState {
        ControllerState::assemble(self.device.status(), self.calls.status(), &self.diagnostics)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.device.status()
    }

    pub fn call_status(&self) -> CallStatus {
        self.calls.status()
    }

    pub fn last_error(&self) -> Option<String> {
        self.diagnostics.last_error()
    }

    pub fn feed(&self) -> &EventFeed {
        self.diagnostics.feed()
    }

    /// Event feed entries, newest first
    pub fn events(&self) -> Vec<EventEntry> {
        self.diagnostics.feed().snapshot()
    }

    pub fn clear_events(&self) {
        self.diagnostics.feed().clear();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.diagnostics.subscribe()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.device.watch()
    }

    pub fn watch_call(&self) -> watch::Receiver<CallStatus> {
        self.calls.watch()
    }

    /// Reset and stop the dispatcher. The controller is unusable afterwards.
    pub async fn shutdown(&self) {
        self.reset().await;
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        info!("Softphone controller stopped");
    }
}

impl Drop for Softphone {
    fn drop(&mut self) {
        // background timers hold the device manager alive; cut them loose
        self.device.reset();
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    device: Arc<DeviceManager>,
    calls: Arc<CallMachine>,
) {
    while let Some(envelope) = rx.recv().await {
        let current = device.generation();
        if envelope.generation != current {
            debug!(
                event = %envelope.notification.name,
                generation = envelope.generation,
                current,
                "Dropping notification from detached device"
            );
            continue;
        }
        trace!(notification = ?envelope.notification, "Dispatching notification");

        match normalize(envelope.notification) {
            Some(NormalizedEvent::Device(event)) => device.handle_event(event),
            Some(NormalizedEvent::Call(event)) => calls.handle_event(event),
            None => {}
        }
    }
    debug!("Notification dispatcher stopped");
}
