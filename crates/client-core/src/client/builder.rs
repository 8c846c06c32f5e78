//! Builder for [`Softphone`] controllers
//!
//! ```no_run
//! use std::sync::Arc;
//! use softphone_client_core::{ClientConfig, DeviceFactory, SoftphoneBuilder};
//!
//! async fn example(factory: Arc<dyn DeviceFactory>) -> softphone_client_core::ClientResult<()> {
//!     let phone = SoftphoneBuilder::new()
//!         .config(ClientConfig::load(None)?)
//!         .device_factory(factory)
//!         .build()
//!         .await?;
//!
//!     phone.initialize("alice").await?;
//!     phone.make_call("+1 (202) 555-0123").await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use crate::call_log::{CallLogStore, MemoryCallLogStore};
use crate::client::{ClientConfig, Softphone};
use crate::error::{ClientError, ClientResult};
use crate::sdk::DeviceFactory;
use crate::token::{HttpTokenClient, TokenProvider};

/// Builder for creating a softphone controller
pub struct SoftphoneBuilder {
    config: ClientConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    device_factory: Option<Arc<dyn DeviceFactory>>,
    call_log_store: Option<Arc<dyn CallLogStore>>,
}

impl SoftphoneBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            token_provider: None,
            device_factory: None,
            call_log_store: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the token endpoint used by the default HTTP token client
    pub fn token_url(mut self, url: impl Into<String>) -> Self {
        self.config.token_url = url.into();
        self
    }

    pub fn event_feed_capacity(mut self, capacity: usize) -> Self {
        self.config.event_feed_capacity = capacity;
        self
    }

    /// Use a custom token source instead of the HTTP endpoint
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// The voice SDK binding. Required.
    pub fn device_factory(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.device_factory = Some(factory);
        self
    }

    /// Call-log persistence; defaults to an in-memory store
    pub fn call_log_store(mut self, store: Arc<dyn CallLogStore>) -> Self {
        self.call_log_store = Some(store);
        self
    }

    /// Build the controller
    pub async fn build(self) -> ClientResult<Arc<Softphone>> {
        let factory = self.device_factory.ok_or_else(|| ClientError::MissingConfiguration {
            field: "device_factory".to_string(),
        })?;
        self.config.validate()?;

        let tokens: Arc<dyn TokenProvider> = match self.token_provider {
            Some(provider) => provider,
            None => Arc::new(HttpTokenClient::from_config(&self.config)?),
        };
        let store: Arc<dyn CallLogStore> = match self.call_log_store {
            Some(store) => store,
            None => Arc::new(MemoryCallLogStore::new()),
        };

        Softphone::new(self.config, tokens, factory, store)
    }
}

impl Default for SoftphoneBuilder {
    fn default() -> Self {
        Self::new()
    }
}
