//! Voice access token acquisition
//!
//! [`TokenProvider`] is the seam the device manager fetches credentials
//! through; [`HttpTokenClient`] is the production implementation against
//! the `GET /token?identity=<identity>` endpoint. There are no retries at
//! this layer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// A short-lived voice access credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceToken {
    pub identity: String,
    pub token: String,
    /// Lifetime of the token in seconds, from the moment it was issued
    #[serde(rename = "expiresIn")]
    pub expires_in_secs: u64,
}

/// Source of voice access tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, identity: &str) -> ClientResult<VoiceToken>;
}

/// Token client for the HTTP token endpoint
#[derive(Debug, Clone)]
pub struct HttpTokenClient {
    http: reqwest::Client,
    token_url: String,
}

impl HttpTokenClient {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::internal_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::new(config.token_url.clone(), config.http_timeout())
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenProvider for HttpTokenClient {
    async fn fetch_token(&self, identity: &str) -> ClientResult<VoiceToken> {
        tracing::debug!(identity = %identity, url = %self.token_url, "Fetching voice token");

        let response = self
            .http
            .get(&self.token_url)
            .query(&[("identity", identity)])
            .send()
            .await
            .map_err(|e| ClientError::token_fetch(e.to_string(), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = if body.trim().is_empty() {
                status.to_string()
            } else {
                body
            };
            tracing::warn!(identity = %identity, status = status.as_u16(), "Token endpoint refused request");
            return Err(ClientError::token_fetch(reason, Some(status.as_u16())));
        }

        let token: VoiceToken = response
            .json()
            .await
            .map_err(|e| ClientError::token_fetch(format!("Malformed token response: {}", e), Some(status.as_u16())))?;

        tracing::info!(identity = %token.identity, expires_in = token.expires_in_secs, "Voice token acquired");
        Ok(token)
    }
}

/// Delay before the proactive refresh: `max(expires_in - lead, min)`
pub fn refresh_delay(expires_in_secs: u64, lead_secs: u64, min_secs: u64) -> Duration {
    Duration::from_secs(expires_in_secs.saturating_sub(lead_secs).max(min_secs))
}
