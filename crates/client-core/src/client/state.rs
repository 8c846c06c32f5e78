//! Shared observable state
//!
//! [`Diagnostics`] owns the three user-facing failure surfaces: the bounded
//! event feed, the single `last_error` slot and the broadcast event stream.
//! Both the device manager and the call state machine report through it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::call::CallState;
use crate::device::{ConnectionStatus, DeviceState};
use crate::events::{ClientEvent, EventPriority};
use crate::feed::{EventEntry, EventFeed};

/// Capacity of the broadcast event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Diagnostics {
    feed: Arc<EventFeed>,
    last_error: Mutex<Option<String>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Diagnostics {
    pub fn new(feed: Arc<EventFeed>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            feed,
            last_error: Mutex::new(None),
            events,
        }
    }

    pub fn feed(&self) -> &Arc<EventFeed> {
        &self.feed
    }

    /// Add an informational entry to the feed
    pub fn note(&self, message: impl Into<String>) {
        self.feed.push(message);
    }

    /// Record a user-visible failure: sets `last_error`, adds the same text
    /// to the feed and broadcasts it.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(error = %message, "Softphone error");
        *self.last_error.lock() = Some(message.clone());
        self.feed.push(message.clone());
        self.emit(ClientEvent::Error {
            message,
            priority: EventPriority::High,
        });
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Point-in-time view of everything the UI renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub connection_status: DeviceState,
    pub connection_message: Option<String>,
    pub call_state: CallState,
    pub is_muted: bool,
    pub is_on_hold: bool,
    pub last_error: Option<String>,
    pub incoming_number: Option<String>,
    /// Event feed, newest first
    pub events: Vec<EventEntry>,
}

impl ControllerState {
    pub(crate) fn assemble(
        connection: ConnectionStatus,
        call: crate::call::CallStatus,
        diagnostics: &Diagnostics,
    ) -> Self {
        Self {
            connection_status: connection.state,
            connection_message: connection.message,
            call_state: call.state,
            is_muted: call.is_muted,
            is_on_hold: call.is_on_hold,
            last_error: diagnostics.last_error(),
            incoming_number: call.incoming_number,
            events: diagnostics.feed().snapshot(),
        }
    }
}
