//! Call data model for the softphone controller
//!
//! This module provides the call state vocabulary, call information
//! structures and the small pure helpers (address normalization, DTMF
//! sanitization) used by the call state machine. All actual media and
//! signaling work is delegated to the telephony SDK behind [`crate::sdk`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque call identifier assigned by the telephony SDK
pub type CallId = String;

/// Normalized state of the tracked call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call is tracked
    Idle,
    /// Outbound call requested, waiting for the far end
    Connecting,
    /// Far end is alerting
    Ringing,
    /// Inbound call waiting for a local decision
    Incoming,
    /// Call is connected and media is flowing
    Active,
    /// Call is connected but held
    Held,
    /// Call ended normally
    Completed,
    /// Call ended on an error
    Failed,
}

impl CallState {
    /// Check if the state ends a call
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }

    /// Check if a new call may be started from this state
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle) || self.is_terminal()
    }

    /// Check if the call has a live leg that can be hung up
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallState::Connecting | CallState::Ringing | CallState::Active | CallState::Held
        )
    }

    /// Check if the call is connected (media controls apply)
    pub fn is_connected(&self) -> bool {
        matches!(self, CallState::Active | CallState::Held)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Ringing => "ringing",
            CallState::Incoming => "incoming",
            CallState::Active => "active",
            CallState::Held => "held",
            CallState::Completed => "completed",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a call (from the console's perspective)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Call placed from this console
    Outbound,
    /// Call received by this console
    Inbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outbound => f.write_str("outbound"),
            CallDirection::Inbound => f.write_str("inbound"),
        }
    }
}

/// Information about the currently tracked call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    /// SDK call identifier, once the SDK has assigned one
    pub call_id: Option<CallId>,
    /// Direction of the call
    pub direction: CallDirection,
    /// E.164 number or `client:` alias of the other party
    pub counterpart: String,
    /// When the call was created locally
    pub created_at: DateTime<Utc>,
    /// When media started flowing (if it did)
    pub started_at: Option<DateTime<Utc>>,
}

/// Observable call status published by the call state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    pub state: CallState,
    pub is_muted: bool,
    pub is_on_hold: bool,
    /// Caller address while a call is pending in [`CallState::Incoming`]
    pub incoming_number: Option<String>,
    /// The tracked call, if any
    pub call: Option<CallInfo>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            is_muted: false,
            is_on_hold: false,
            incoming_number: None,
            call: None,
        }
    }
}

/// Prefix used by the SDK for internal client aliases
pub const CLIENT_ALIAS_PREFIX: &str = "client:";

/// Normalize a dial target into an E.164-style number or a client alias.
///
/// Returns `None` when the input is neither.
pub fn normalize_address(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if let Some(alias) = trimmed.strip_prefix(CLIENT_ALIAS_PREFIX) {
        let alias = alias.trim();
        if alias.is_empty() || alias.chars().any(char::is_whitespace) {
            return None;
        }
        return Some(format!("{}{}", CLIENT_ALIAS_PREFIX, alias));
    }

    let compact: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    let (plus, digits) = match compact.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", compact.as_str()),
    };
    if (3..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{}{}", plus, digits))
    } else {
        None
    }
}

/// Reduce arbitrary input to the DTMF tone alphabet `[0-9A-D#*]`.
pub fn sanitize_dtmf(input: &str) -> String {
    input
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| matches!(c, '0'..='9' | 'A'..='D' | '*' | '#'))
        .collect()
}
