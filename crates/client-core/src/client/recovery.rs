//! Retry and timeout helpers for call-log persistence
//!
//! Only the call-log bridge retries; token fetch and registration failures
//! surface immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Backoff policy for store writes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by up to ±10%
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Quick retries for store writes
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Pause before retry number `retry` (1 for the first retry), before jitter
    pub fn delay_before(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }
        let spread = rand::random::<f64>() * 0.2 - 0.1;
        delay.mul_f64(1.0 + spread)
    }
}

/// Run `operation` until it succeeds, fails with a non-recoverable error, or
/// runs out of attempts. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(operation_name: &str, config: RetryConfig, mut operation: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_recoverable() {
            debug!(operation = operation_name, error = %err, "Not retrying");
            return Err(err);
        }
        if attempt >= config.max_attempts {
            warn!(operation = operation_name, attempts = attempt, error = %err, "Giving up");
            return Err(err);
        }

        let pause = config.jittered(config.delay_before(attempt));
        debug!(
            operation = operation_name,
            attempt,
            error = %err,
            pause_ms = pause.as_millis() as u64,
            "Retrying"
        );
        tokio::time::sleep(pause).await;
        attempt += 1;
    }
}

/// Fail with [`ClientError::OperationTimeout`] if `future` outlives `limit`
pub async fn with_timeout<T, F>(operation_name: &str, limit: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    let duration_ms = limit.as_millis() as u64;
    tokio::time::timeout(limit, future).await.unwrap_or_else(|_| {
        warn!(operation = operation_name, timeout_ms = duration_ms, "Timed out");
        Err(ClientError::OperationTimeout { duration_ms })
    })
}
