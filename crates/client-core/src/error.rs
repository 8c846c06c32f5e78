//! Error types and handling for the softphone controller
//!
//! Errors are categorized to help callers decide what to do with them:
//!
//! - **Token Errors** - The token endpoint was unreachable or refused the identity
//! - **Readiness Errors** - An operation needed a ready device and there was none
//! - **Transport Errors** - The SDK reported a socket or registration failure
//! - **Call Control Errors** - Mute, hold or DTMF was rejected by the live call
//! - **Persistence Errors** - The call-log store could not be written
//!
//! Transport and token errors surface as the controller's `last_error`.
//! Persistence and call-control errors are logged to the event feed and
//! never interrupt call handling.
//!
//! # Basic Pattern
//!
//! ```rust,no_run
//! # use softphone_client_core::{Softphone, ClientError};
//! # use std::sync::Arc;
//! # async fn example(phone: Arc<Softphone>) {
//! match phone.make_call("+12025550123").await {
//!     Ok(()) => println!("Dialing"),
//!     Err(ClientError::NotReady) => {
//!         // Initialize the device first
//!     }
//!     Err(e) => eprintln!("Call failed ({}): {}", e.category(), e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::call::CallState;

/// Result type alias for controller operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Error types for softphone controller operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The token endpoint failed; `reason` carries the endpoint's message verbatim
    #[error("Token fetch failed: {reason}")]
    TokenFetch { reason: String, status: Option<u16> },

    #[error("Device is not ready")]
    NotReady,

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Call control failed: {reason}")]
    CallControl { reason: String },

    #[error("Persistence error: {reason}")]
    Persistence { reason: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("A call is already in progress (state: {state})")]
    CallInProgress { state: CallState },

    #[error("Invalid call state: expected {expected}, got {actual}")]
    InvalidCallState { expected: String, actual: String },

    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Configuration errors
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Missing required configuration: {field}")]
    MissingConfiguration { field: String },

    /// Generic errors
    #[error("Operation timeout after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl ClientError {
    /// Create a token fetch error
    pub fn token_fetch(reason: impl Into<String>, status: Option<u16>) -> Self {
        Self::TokenFetch { reason: reason.into(), status }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    /// Create a call control error
    pub fn call_control(reason: impl Into<String>) -> Self {
        Self::CallControl { reason: reason.into() }
    }

    /// Create a persistence error
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence { reason: reason.into() }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Check if this error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::TokenFetch { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            ClientError::Transport { .. }
            | ClientError::Persistence { .. }
            | ClientError::OperationTimeout { .. } => true,

            ClientError::NotReady
            | ClientError::CallControl { .. }
            | ClientError::Cancelled { .. }
            | ClientError::CallInProgress { .. }
            | ClientError::InvalidCallState { .. }
            | ClientError::InvalidAddress { .. }
            | ClientError::InvalidConfiguration { .. }
            | ClientError::MissingConfiguration { .. }
            | ClientError::InternalError { .. } => false,
        }
    }

    /// Check if error is call-related
    pub fn is_call_error(&self) -> bool {
        matches!(
            self,
            ClientError::CallControl { .. }
                | ClientError::CallInProgress { .. }
                | ClientError::InvalidCallState { .. }
                | ClientError::InvalidAddress { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::TokenFetch { .. } => "token",
            ClientError::NotReady | ClientError::Cancelled { .. } => "device",
            ClientError::Transport { .. } => "transport",
            ClientError::CallControl { .. }
            | ClientError::CallInProgress { .. }
            | ClientError::InvalidCallState { .. }
            | ClientError::InvalidAddress { .. } => "call",
            ClientError::Persistence { .. } => "persistence",
            ClientError::InvalidConfiguration { .. } | ClientError::MissingConfiguration { .. } => {
                "configuration"
            }
            ClientError::OperationTimeout { .. } | ClientError::InternalError { .. } => "system",
        }
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::InvalidConfiguration {
            field: "config".to_string(),
            reason: err.to_string(),
        }
    }
}
