//! Telephony SDK seam
//!
//! The controller orchestrates an externally supplied voice SDK that already
//! implements transport and signaling. This module defines the narrow surface
//! the controller needs from it:
//!
//! - [`DeviceFactory`] constructs a [`VoiceDevice`] from a token and options
//! - [`VoiceDevice`] is the registered client (register, token swap, dial)
//! - [`CallLeg`] is one call handle (accept, reject, mute, hold, DTMF)
//! - [`SdkNotification`] is a raw, SDK-vocabulary event delivered through a
//!   [`NotificationSink`]; it is normalized by [`crate::normalize`] before
//!   reaching any state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::call::CallId;

/// Audio codecs the SDK can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Pcmu,
}

/// Options handed to the SDK when a device is constructed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    pub codec_preferences: Vec<Codec>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Parameters for an outbound call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectParams {
    /// Normalized dial target
    pub to: String,
    /// Extra parameters forwarded to the voice application
    pub params: HashMap<String, String>,
}

impl ConnectParams {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Failure reported by the SDK
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SdkError {
    /// SDK-specific numeric code, when the SDK provides one
    pub code: Option<u32>,
    pub message: String,
}

impl SdkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// A registered voice client
#[async_trait]
pub trait VoiceDevice: Send + Sync {
    /// Register with the signaling service so calls can be placed and received
    async fn register(&self) -> Result<(), SdkError>;

    /// Swap the access token on the live connection
    async fn update_token(&self, token: &str) -> Result<(), SdkError>;

    /// Place an outbound call
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn CallLeg>, SdkError>;

    /// Tear the client down; must be safe to call more than once
    fn destroy(&self);
}

/// A single call handle owned by the SDK
#[async_trait]
pub trait CallLeg: Send + Sync {
    /// SDK call identifier; may only become available after creation
    fn id(&self) -> Option<CallId>;

    async fn accept(&self) -> Result<(), SdkError>;

    async fn reject(&self) -> Result<(), SdkError>;

    async fn disconnect(&self) -> Result<(), SdkError>;

    async fn mute(&self, muted: bool) -> Result<(), SdkError>;

    async fn hold(&self, on_hold: bool) -> Result<(), SdkError>;

    async fn send_digits(&self, digits: &str) -> Result<(), SdkError>;
}

/// Constructs SDK devices
pub trait DeviceFactory: Send + Sync {
    fn create(
        &self,
        token: &str,
        options: &DeviceOptions,
        sink: NotificationSink,
    ) -> Result<Arc<dyn VoiceDevice>, SdkError>;
}

/// Whether a notification concerns the device or one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationScope {
    Device,
    Call,
}

/// A raw notification in the SDK's own vocabulary
#[derive(Clone)]
pub struct SdkNotification {
    pub scope: NotificationScope,
    /// SDK event name, e.g. `registered`, `tokenWillExpire`, `accept`
    pub name: String,
    /// Call the notification refers to, if the SDK reported one
    pub call_id: Option<CallId>,
    /// Event payload as delivered by the SDK
    pub payload: serde_json::Value,
    /// Call handle for `incoming` notifications
    pub leg: Option<Arc<dyn CallLeg>>,
}

impl SdkNotification {
    /// Device-level notification
    pub fn device(name: impl Into<String>) -> Self {
        Self {
            scope: NotificationScope::Device,
            name: name.into(),
            call_id: None,
            payload: serde_json::Value::Null,
            leg: None,
        }
    }

    /// Call-level notification
    pub fn call(name: impl Into<String>, call_id: Option<CallId>) -> Self {
        Self {
            scope: NotificationScope::Call,
            name: name.into(),
            call_id,
            payload: serde_json::Value::Null,
            leg: None,
        }
    }

    /// Incoming call offered by the SDK
    pub fn incoming(leg: Arc<dyn CallLeg>, payload: serde_json::Value) -> Self {
        Self {
            scope: NotificationScope::Device,
            name: "incoming".to_string(),
            call_id: leg.id(),
            payload,
            leg: Some(leg),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

impl fmt::Debug for SdkNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkNotification")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .field("call_id", &self.call_id)
            .field("payload", &self.payload)
            .field("leg", &self.leg.as_ref().map(|_| "<call leg>"))
            .finish()
    }
}

/// A notification tagged with the device generation that produced it
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub generation: u64,
    pub notification: SdkNotification,
}

/// Listener handle given to a device at construction.
///
/// Notifications emitted after the owning device generation has been reset
/// are dropped by the dispatcher.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl NotificationSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver a notification; never fails, even after the controller is gone
    pub fn emit(&self, notification: SdkNotification) {
        let envelope = Envelope {
            generation: self.generation,
            notification,
        };
        if self.tx.send(envelope).is_err() {
            tracing::debug!(generation = self.generation, "Notification dropped, dispatcher stopped");
        }
    }
}
