//! Softphone call session controller
//!
//! This crate sits between a softphone UI and an externally supplied voice
//! SDK. It owns the device lifecycle (token acquisition, registration, token
//! refresh, teardown), a single-call state machine, a bounded diagnostic
//! event feed, and call-log persistence.
//!
//! ```text
//!  UI ──► Softphone ──► DeviceManager ──► VoiceDevice (SDK)
//!             │                               │
//!             └──► CallMachine ◄── dispatcher ◄┘ notifications
//!                      │
//!                 CallLogBridge ──► CallLogStore
//! ```
//!
//! The SDK is reached only through the traits in [`sdk`]; the token endpoint
//! through [`token::TokenProvider`]; the call-log service through
//! [`call_log::CallLogStore`].

pub mod call;
pub mod call_log;
pub mod client;
pub mod device;
pub mod error;
pub mod events;
pub mod feed;
pub mod normalize;
pub mod sdk;
pub mod token;

// Public API exports
pub use call::{normalize_address, sanitize_dtmf, CallDirection, CallId, CallInfo, CallState, CallStatus};
pub use call_log::{CallLogBridge, CallLogRecord, CallLogStatus, CallLogStore, LogId, MemoryCallLogStore};
pub use client::{ClientConfig, ControllerState, Softphone, SoftphoneBuilder};
pub use device::{ConnectionStatus, DeviceManager, DeviceState};
pub use error::{ClientError, ClientResult};
pub use events::{CallStatusInfo, ClientEvent, EventPriority, IncomingCallInfo};
pub use feed::{EventEntry, EventFeed};
pub use sdk::{
    CallLeg, Codec, ConnectParams, DeviceFactory, DeviceOptions, NotificationSink, SdkError, SdkNotification,
    VoiceDevice,
};
pub use token::{HttpTokenClient, TokenProvider, VoiceToken};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
