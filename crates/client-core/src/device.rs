//! Device lifecycle management
//!
//! The [`DeviceManager`] owns the at-most-one live SDK device. It fetches a
//! voice token, constructs and registers the device, keeps the token fresh,
//! and tracks connectivity from device-level SDK events.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Disconnected
//!                       |            |
//!                       v            v
//!                     Error <--------+
//! ```
//!
//! Every bring-up is tagged with a *generation*. [`DeviceManager::reset`]
//! bumps the generation, which cancels an in-flight bring-up and detaches the
//! old device's notification sink: anything it emits afterwards is dropped.
//!
//! ```rust
//! use softphone_client_core::device::DeviceState;
//!
//! assert_eq!(DeviceState::Ready.to_string(), "ready");
//! assert!(DeviceState::Ready.can_place_calls());
//! assert!(!DeviceState::Disconnected.can_place_calls());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::client::state::Diagnostics;
use crate::client::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventPriority};
use crate::normalize::DeviceEvent;
use crate::sdk::{DeviceFactory, Envelope, NotificationSink, VoiceDevice};
use crate::token::{refresh_delay, TokenProvider, VoiceToken};

/// Connectivity of the voice device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Disconnected,
}

impl DeviceState {
    pub fn can_place_calls(&self) -> bool {
        matches!(self, DeviceState::Ready)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Initializing => "initializing",
            DeviceState::Ready => "ready",
            DeviceState::Error => "error",
            DeviceState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Connection state plus a human-readable description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: DeviceState,
    pub message: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: DeviceState::Uninitialized,
            message: None,
        }
    }
}

type InitFuture = Shared<BoxFuture<'static, ClientResult<Arc<dyn VoiceDevice>>>>;

struct PendingInit {
    generation: u64,
    future: InitFuture,
    task: AbortHandle,
}

struct DeviceInner {
    state: DeviceState,
    message: Option<String>,
    identity: Option<String>,
    device: Option<Arc<dyn VoiceDevice>>,
    token: Option<VoiceToken>,
    pending: Option<PendingInit>,
    refresh_task: Option<JoinHandle<()>>,
    next_refresh: Option<Duration>,
    generation: u64,
}

impl DeviceInner {
    fn cancel_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.next_refresh = None;
    }
}

/// Owner of the SDK device and its token
pub struct DeviceManager {
    config: Arc<ClientConfig>,
    tokens: Arc<dyn TokenProvider>,
    factory: Arc<dyn DeviceFactory>,
    diagnostics: Arc<Diagnostics>,
    notify_tx: mpsc::UnboundedSender<Envelope>,
    status_tx: watch::Sender<ConnectionStatus>,
    inner: Mutex<DeviceInner>,
}

impl DeviceManager {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        tokens: Arc<dyn TokenProvider>,
        factory: Arc<dyn DeviceFactory>,
        diagnostics: Arc<Diagnostics>,
        notify_tx: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            config,
            tokens,
            factory,
            diagnostics,
            notify_tx,
            status_tx,
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Uninitialized,
                message: None,
                identity: None,
                device: None,
                token: None,
                pending: None,
                refresh_task: None,
                next_refresh: None,
                generation: 0,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock();
        ConnectionStatus {
            state: inner.state,
            message: inner.message.clone(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Current device generation; notifications from older generations are stale
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn identity(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    pub fn token(&self) -> Option<VoiceToken> {
        self.inner.lock().token.clone()
    }

    /// Delay of the currently scheduled proactive refresh, if one is armed
    pub fn next_refresh_delay(&self) -> Option<Duration> {
        self.inner.lock().next_refresh
    }

    /// The device, if it is registered and able to place calls
    pub fn ready_device(&self) -> ClientResult<Arc<dyn VoiceDevice>> {
        let inner = self.inner.lock();
        match (&inner.device, inner.state) {
            (Some(device), DeviceState::Ready) => Ok(device.clone()),
            _ => Err(ClientError::NotReady),
        }
    }

    /// Bring up a registered device for `identity`.
    ///
    /// Concurrent callers for the same identity share one bring-up and all
    /// observe the same result. A different identity tears down the current
    /// device first. If [`reset`](Self::reset) runs while a bring-up is in
    /// flight, every waiter receives [`ClientError::Cancelled`].
    pub async fn initialize(self: &Arc<Self>, identity: &str) -> ClientResult<Arc<dyn VoiceDevice>> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(ClientError::InvalidConfiguration {
                field: "identity".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let future = {
            let mut inner = self.inner.lock();
            if inner.identity.as_deref() == Some(identity) {
                if inner.state == DeviceState::Ready {
                    if let Some(device) = &inner.device {
                        debug!(identity = %identity, "Device already ready");
                        return Ok(device.clone());
                    }
                }
                let joined = inner.pending.as_ref().map(|p| (p.generation, p.future.clone()));
                match joined {
                    Some((generation, future)) => {
                        debug!(identity = %identity, generation, "Joining in-flight initialization");
                        future
                    }
                    None => self.begin(&mut inner, identity),
                }
            } else {
                if let Some(previous) = inner.identity.clone() {
                    info!(from = %previous, to = %identity, "Identity changed, tearing down device");
                    self.teardown(&mut inner);
                }
                self.begin(&mut inner, identity)
            }
        };

        let result = future.await;
        if let Err(e) = &result {
            debug!(identity = %identity, error = %e, "Initialization returned an error");
        }
        result
    }

    fn begin(self: &Arc<Self>, inner: &mut DeviceInner, identity: &str) -> InitFuture {
        // a failed or disconnected client is never reused
        if let Some(old) = inner.device.take() {
            old.destroy();
        }
        inner.cancel_refresh();
        inner.generation += 1;
        inner.identity = Some(identity.to_string());
        inner.token = None;
        let generation = inner.generation;
        self.set_state(inner, DeviceState::Initializing, Some("Initializing device".to_string()));

        let this = Arc::clone(self);
        let identity = identity.to_string();
        let handle = tokio::spawn(async move { this.bring_up(generation, identity).await });
        let task = handle.abort_handle();

        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ClientError::cancelled("device initialization")),
                Err(e) => Err(ClientError::internal_error(format!("Device initialization panicked: {}", e))),
            }
        }
        .boxed()
        .shared();

        inner.pending = Some(PendingInit {
            generation,
            future: future.clone(),
            task,
        });
        future
    }

    async fn bring_up(self: Arc<Self>, generation: u64, identity: String) -> ClientResult<Arc<dyn VoiceDevice>> {
        info!(identity = %identity, generation, "Initializing voice device");

        let token = match self.tokens.fetch_token(&identity).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_init(generation, &e);
                return Err(e);
            }
        };

        let sink = NotificationSink::new(generation, self.notify_tx.clone());
        let device = match self.factory.create(&token.token, &self.config.device_options(), sink) {
            Ok(device) => device,
            Err(e) => {
                let err = ClientError::transport(format!("Failed to create device: {}", e));
                self.fail_init(generation, &err);
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                drop(inner);
                device.destroy();
                return Err(ClientError::cancelled("device initialization"));
            }
            inner.device = Some(device.clone());
        }

        if let Err(e) = device.register().await {
            let err = ClientError::transport(format!("Registration failed: {}", e));
            self.fail_init(generation, &err);
            return Err(err);
        }

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                drop(inner);
                device.destroy();
                return Err(ClientError::cancelled("device initialization"));
            }
            inner.pending = None;
            inner.token = Some(token.clone());
            self.set_state(&mut inner, DeviceState::Ready, Some("Ready".to_string()));
            self.schedule_refresh(&mut inner, generation, token.expires_in_secs);
        }

        self.diagnostics.clear_error();
        self.diagnostics.note(format!("Device ready for {}", identity));
        Ok(device)
    }

    fn fail_init(&self, generation: u64, error: &ClientError) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.pending = None;
            if let Some(device) = inner.device.take() {
                device.destroy();
            }
            self.set_state(&mut inner, DeviceState::Error, Some(error.to_string()));
        }
        warn!(generation, error = %error, category = error.category(), "Device initialization failed");
        self.diagnostics.fail(error.to_string());
    }

    /// Tear down the device and return to `Uninitialized`.
    ///
    /// Cancels any pending bring-up and the refresh timer. Safe to call when
    /// no device exists.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Uninitialized && inner.device.is_none() && inner.pending.is_none() {
            debug!("Reset with no device, nothing to do");
            return;
        }
        self.teardown(&mut inner);
        drop(inner);
        self.diagnostics.clear_error();
        self.diagnostics.note("Device reset");
    }

    fn teardown(&self, inner: &mut DeviceInner) {
        inner.cancel_refresh();
        if let Some(pending) = inner.pending.take() {
            pending.task.abort();
        }
        if let Some(device) = inner.device.take() {
            device.destroy();
        }
        inner.generation += 1;
        inner.identity = None;
        inner.token = None;
        info!(generation = inner.generation, "Device torn down");
        self.set_state(inner, DeviceState::Uninitialized, None);
    }

    /// Apply a device-level event from the current generation
    pub fn handle_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Registered => {
                let mut inner = self.inner.lock();
                if inner.device.is_none() {
                    return;
                }
                let state = inner.state;
                match state {
                    DeviceState::Disconnected | DeviceState::Error => {
                        self.set_state(&mut inner, DeviceState::Ready, Some("Reconnected".to_string()));
                        drop(inner);
                        self.diagnostics.note("Device reconnected");
                    }
                    state => debug!(state = %state, "Registered event without state change"),
                }
            }
            DeviceEvent::Unregistered { reason } => {
                let message = reason.unwrap_or_else(|| "Disconnected".to_string());
                let mut inner = self.inner.lock();
                if inner.state != DeviceState::Ready {
                    debug!(state = %inner.state, "Ignoring unregistered event");
                    return;
                }
                self.set_state(&mut inner, DeviceState::Disconnected, Some(message.clone()));
                drop(inner);
                self.diagnostics.note(format!("Device disconnected: {}", message));
            }
            DeviceEvent::Error { message } => {
                {
                    let mut inner = self.inner.lock();
                    if inner.device.is_none() {
                        return;
                    }
                    // bring-up reports its own outcome
                    if inner.state != DeviceState::Initializing {
                        self.set_state(&mut inner, DeviceState::Error, Some(message.clone()));
                    }
                }
                self.diagnostics.fail(format!("Device error: {}", message));
            }
            DeviceEvent::TokenWillExpire => {
                let generation = {
                    let inner = self.inner.lock();
                    if inner.device.is_none() {
                        debug!(state = %inner.state, "Token expiry warning with no device, ignoring");
                        return;
                    }
                    inner.generation
                };
                self.diagnostics.note("Access token expiring soon, refreshing");
                let this = Arc::clone(self);
                tokio::spawn(async move { this.refresh_token(generation).await });
            }
        }
    }

    fn schedule_refresh(self: &Arc<Self>, inner: &mut DeviceInner, generation: u64, expires_in_secs: u64) {
        inner.cancel_refresh();
        let delay = refresh_delay(
            expires_in_secs,
            self.config.token_refresh_lead_secs,
            self.config.token_refresh_min_secs,
        );
        inner.next_refresh = Some(delay);
        debug!(generation, delay_secs = delay.as_secs(), "Token refresh scheduled");

        let this = Arc::clone(self);
        inner.refresh_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = this.inner.lock();
                if inner.generation != generation {
                    return;
                }
                // the timer has fired; rescheduling must not abort this task
                inner.refresh_task = None;
                inner.next_refresh = None;
            }
            this.refresh_token(generation).await;
        }));
    }

    /// Fetch a fresh token and hand it to the live device.
    ///
    /// Failures are reported to the feed only: the device keeps its current
    /// state and no further refresh is scheduled.
    async fn refresh_token(self: &Arc<Self>, generation: u64) {
        let (identity, device) = {
            let inner = self.inner.lock();
            if inner.generation != generation {
                debug!(generation, "Skipping refresh for stale device");
                return;
            }
            match (&inner.identity, &inner.device) {
                (Some(identity), Some(device)) => (identity.clone(), device.clone()),
                _ => return,
            }
        };

        let result = async {
            let token = self.tokens.fetch_token(&identity).await?;
            device
                .update_token(&token.token)
                .await
                .map_err(|e| ClientError::transport(format!("Token update rejected: {}", e)))?;
            Ok::<_, ClientError>(token)
        }
        .await;

        match result {
            Ok(token) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.generation != generation {
                        return;
                    }
                    inner.token = Some(token.clone());
                    self.schedule_refresh(&mut inner, generation, token.expires_in_secs);
                }
                info!(identity = %identity, expires_in = token.expires_in_secs, "Access token refreshed");
                self.diagnostics.note("Access token refreshed");
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Token refresh failed");
                self.diagnostics.note(format!("Token refresh failed: {}", e));
            }
        }
    }

    fn set_state(&self, inner: &mut DeviceInner, state: DeviceState, message: Option<String>) {
        let previous = inner.state;
        inner.state = state;
        inner.message = message.clone();
        let status = ConnectionStatus { state, message };
        self.status_tx.send_replace(status.clone());

        if previous != state {
            info!(from = %previous, to = %state, "Device state changed");
        }
        let priority = match state {
            DeviceState::Error => EventPriority::High,
            _ => EventPriority::Normal,
        };
        self.diagnostics.emit(ClientEvent::ConnectionChanged { status, priority });
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.cancel_refresh();
        if let Some(pending) = inner.pending.take() {
            pending.task.abort();
        }
        if let Some(device) = inner.device.take() {
            device.destroy();
        }
    }
}
