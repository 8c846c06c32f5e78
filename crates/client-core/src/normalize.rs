//! Normalization of raw SDK notifications
//!
//! Every [`SdkNotification`] is mapped here, at the boundary, into a closed
//! set of typed events. The device manager and the call state machine only
//! ever see [`NormalizedEvent`]s, so SDK vocabulary drift stays in this file.
//! Unknown notifications are dropped.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::call::CallId;
use crate::sdk::{CallLeg, NotificationScope, SdkNotification};

/// Device-level (transport) events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Registered / transport connected
    Registered,
    /// Transport dropped or registration lost
    Unregistered { reason: Option<String> },
    /// Transport or registration failure
    Error { message: String },
    /// The SDK expects the access token to expire soon
    TokenWillExpire,
}

/// What happened to a call
#[derive(Clone)]
pub enum CallEventKind {
    Incoming { leg: Arc<dyn CallLeg>, from: String },
    Ringing,
    Accepted,
    Disconnected,
    /// The caller gave up before the call was answered
    Cancelled,
    /// The far end rejected the call
    Rejected,
    Error { message: String },
}

impl fmt::Debug for CallEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEventKind::Incoming { from, .. } => {
                f.debug_struct("Incoming").field("from", from).finish_non_exhaustive()
            }
            CallEventKind::Ringing => f.write_str("Ringing"),
            CallEventKind::Accepted => f.write_str("Accepted"),
            CallEventKind::Disconnected => f.write_str("Disconnected"),
            CallEventKind::Cancelled => f.write_str("Cancelled"),
            CallEventKind::Rejected => f.write_str("Rejected"),
            CallEventKind::Error { message } => {
                f.debug_struct("Error").field("message", message).finish()
            }
        }
    }
}

/// A call-level event, tagged with the call it refers to
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub call_id: Option<CallId>,
    pub kind: CallEventKind,
}

/// Typed internal event
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    Device(DeviceEvent),
    Call(CallEvent),
}

/// Map a raw notification into the internal vocabulary
pub fn normalize(notification: SdkNotification) -> Option<NormalizedEvent> {
    let SdkNotification {
        scope,
        name,
        call_id,
        payload,
        leg,
    } = notification;

    if name.eq_ignore_ascii_case("incoming") {
        let Some(leg) = leg else {
            tracing::warn!("Incoming notification without a call handle, dropping");
            return None;
        };
        let call_id = call_id.or_else(|| leg.id());
        let from = payload_str(&payload, &["from", "From", "caller"]).unwrap_or_else(|| "unknown".to_string());
        return Some(NormalizedEvent::Call(CallEvent {
            call_id,
            kind: CallEventKind::Incoming { leg, from },
        }));
    }

    let event = match scope {
        NotificationScope::Device => normalize_device(&name, &payload).map(NormalizedEvent::Device),
        NotificationScope::Call => normalize_call(&name, &payload)
            .map(|kind| NormalizedEvent::Call(CallEvent { call_id, kind })),
    };

    if event.is_none() {
        tracing::debug!(name = %name, scope = ?scope, "Ignoring unrecognized SDK notification");
    }
    event
}

fn normalize_device(name: &str, payload: &Value) -> Option<DeviceEvent> {
    match name {
        "registered" | "ready" | "connect" | "connected" => Some(DeviceEvent::Registered),
        "unregistered" | "offline" | "disconnect" | "disconnected" => Some(DeviceEvent::Unregistered {
            reason: payload_str(payload, &["reason", "message"]),
        }),
        "error" => Some(DeviceEvent::Error {
            message: error_message(payload),
        }),
        "tokenWillExpire" | "token-will-expire" | "tokenWillExpireSoon" => Some(DeviceEvent::TokenWillExpire),
        _ => None,
    }
}

fn normalize_call(name: &str, payload: &Value) -> Option<CallEventKind> {
    match name {
        "ringing" => Some(CallEventKind::Ringing),
        "accept" | "accepted" | "connect" | "connected" => Some(CallEventKind::Accepted),
        "disconnect" | "disconnected" => Some(CallEventKind::Disconnected),
        "cancel" | "canceled" | "cancelled" => Some(CallEventKind::Cancelled),
        "reject" | "rejected" => Some(CallEventKind::Rejected),
        "error" => Some(CallEventKind::Error {
            message: error_message(payload),
        }),
        _ => None,
    }
}

fn payload_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| value.as_str().map(str::to_string))
        .filter(|s| !s.is_empty())
}

fn error_message(payload: &Value) -> String {
    let message = payload_str(payload, &["message", "description"])
        .or_else(|| payload.as_str().map(str::to_string))
        .unwrap_or_else(|| "Unknown error".to_string());
    match payload.get("code").and_then(Value::as_u64) {
        Some(code) => format!("{} (code {})", message, code),
        None => message,
    }
}
