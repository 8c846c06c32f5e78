use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::sdk::{Codec, DeviceOptions};

/// Environment prefix for configuration overrides (`SOFTPHONE__TOKEN_URL`, ...)
pub const ENV_PREFIX: &str = "SOFTPHONE";

/// Configuration for the softphone controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Token endpoint, queried as `GET <token_url>?identity=<identity>`
    pub token_url: String,
    /// Codecs offered to the SDK in order of preference
    pub codec_preferences: Vec<Codec>,
    /// Audio input binding handed to the SDK
    pub input_device: Option<String>,
    /// Audio output binding handed to the SDK
    pub output_device: Option<String>,
    /// Maximum number of diagnostic entries kept in the event feed
    pub event_feed_capacity: usize,
    /// How long before token expiry the proactive refresh fires
    pub token_refresh_lead_secs: u64,
    /// Lower bound for the proactive refresh delay
    pub token_refresh_min_secs: u64,
    /// Request timeout for the token endpoint
    pub http_timeout_secs: u64,
    /// Upper bound for a single call-log store operation
    pub persistence_timeout_ms: u64,
    /// Attempts per call-log store operation
    pub persistence_retry_attempts: u32,
    /// How long a completed/failed call stays visible before resetting to idle
    pub terminal_reset_ms: Option<u64>,
}

impl ClientConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            token_url: "http://127.0.0.1:3000/token".to_string(),
            codec_preferences: vec![Codec::Opus, Codec::Pcmu],
            input_device: None,
            output_device: None,
            event_feed_capacity: 100,
            token_refresh_lead_secs: 120,
            token_refresh_min_secs: 30,
            http_timeout_secs: 10,
            persistence_timeout_ms: 5_000,
            persistence_retry_attempts: 3,
            terminal_reset_ms: Some(3_000),
        }
    }

    /// Load configuration from defaults, an optional file, and the environment.
    ///
    /// Later sources win: file values override defaults and
    /// `SOFTPHONE__*` variables override both.
    pub fn load(path: Option<&Path>) -> ClientResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::new())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("codec_preferences")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values that serde cannot
    pub fn validate(&self) -> ClientResult<()> {
        let url = url::Url::parse(&self.token_url).map_err(|e| ClientError::InvalidConfiguration {
            field: "token_url".to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidConfiguration {
                field: "token_url".to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if self.event_feed_capacity == 0 {
            return Err(ClientError::InvalidConfiguration {
                field: "event_feed_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.codec_preferences.is_empty() {
            return Err(ClientError::InvalidConfiguration {
                field: "codec_preferences".to_string(),
                reason: "at least one codec is required".to_string(),
            });
        }
        Ok(())
    }

    /// Set the token endpoint
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Set preferred codecs
    pub fn with_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codec_preferences = codecs;
        self
    }

    /// Set audio device bindings
    pub fn with_audio_devices(mut self, input: Option<String>, output: Option<String>) -> Self {
        self.input_device = input;
        self.output_device = output;
        self
    }

    /// Set event feed capacity
    pub fn with_event_feed_capacity(mut self, capacity: usize) -> Self {
        self.event_feed_capacity = capacity;
        self
    }

    /// Set the token refresh lead time and lower bound
    pub fn with_token_refresh(mut self, lead_secs: u64, min_secs: u64) -> Self {
        self.token_refresh_lead_secs = lead_secs;
        self.token_refresh_min_secs = min_secs;
        self
    }

    /// Set persistence timeout and attempts
    pub fn with_persistence(mut self, timeout_ms: u64, attempts: u32) -> Self {
        self.persistence_timeout_ms = timeout_ms;
        self.persistence_retry_attempts = attempts;
        self
    }

    /// Set (or disable with `None`) the terminal-state display time
    pub fn with_terminal_reset(mut self, reset_ms: Option<u64>) -> Self {
        self.terminal_reset_ms = reset_ms;
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    pub fn terminal_reset(&self) -> Option<Duration> {
        self.terminal_reset_ms.map(Duration::from_millis)
    }

    /// SDK construction options derived from this configuration
    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions {
            codec_preferences: self.codec_preferences.clone(),
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
