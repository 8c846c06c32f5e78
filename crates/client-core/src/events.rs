//! Event stream for UI consumers
//!
//! The controller publishes a [`ClientEvent`] on a broadcast channel for
//! every observable change: connectivity, call state transitions, incoming
//! calls and surfaced errors.

use chrono::{DateTime, Utc};

use crate::call::{CallDirection, CallId, CallState};
use crate::device::ConnectionStatus;

/// Information about an incoming call
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCallInfo {
    pub call_id: Option<CallId>,
    /// Address of the caller
    pub from: String,
    pub received_at: DateTime<Utc>,
}

/// Information about a call state change
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatusInfo {
    /// Call that changed state (if the SDK assigned an id yet)
    pub call_id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub new_state: CallState,
    pub previous_state: CallState,
    /// Reason for the state change (if available)
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Event priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// Routine status updates
    Low,
    /// State changes
    Normal,
    /// Incoming calls, errors
    High,
}

/// Client event types
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connectivity of the device changed
    ConnectionChanged {
        status: ConnectionStatus,
        priority: EventPriority,
    },
    /// Incoming call received
    IncomingCall {
        info: IncomingCallInfo,
        priority: EventPriority,
    },
    /// Call state changed
    CallStateChanged {
        info: CallStatusInfo,
        priority: EventPriority,
    },
    /// A failure was surfaced as the controller's last error
    Error {
        message: String,
        priority: EventPriority,
    },
}

impl ClientEvent {
    /// Get the priority of this event
    pub fn priority(&self) -> EventPriority {
        match self {
            ClientEvent::ConnectionChanged { priority, .. }
            | ClientEvent::IncomingCall { priority, .. }
            | ClientEvent::CallStateChanged { priority, .. }
            | ClientEvent::Error { priority, .. } => *priority,
        }
    }

    /// Get the call ID associated with this event (if any)
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ClientEvent::IncomingCall { info, .. } => info.call_id.as_ref(),
            ClientEvent::CallStateChanged { info, .. } => info.call_id.as_ref(),
            _ => None,
        }
    }
}
