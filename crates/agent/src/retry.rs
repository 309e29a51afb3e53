//! Retry policy for model gateway calls.
//!
//! Transient failures (rate limiting, unavailability, timeouts) back off
//! exponentially with jitter up to an attempt cap. A malformed response is
//! retried exactly once, immediately. Authentication failures are final.

use std::future::Future;
use std::time::Duration;

use anjia_config::RetryConfig;
use anjia_core::error::{GatewayError, RetryClass};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for backoff-class failures, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// `base * 2^(attempt-1)`, raised to the server's `Retry-After` hint when
    /// one was given, and capped at `max_delay`.
    pub fn backoff(&self, attempt: u32, err: &GatewayError) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let hinted = match err {
            GatewayError::RateLimited {
                retry_after_secs: Some(secs),
            } => exp.max(Duration::from_secs(*secs)),
            _ => exp,
        };
        hinted.min(self.max_delay)
    }

    /// Run `op` until it succeeds or the failure is not retryable.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        let mut protocol_retried = false;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let delay = match err.retry_class() {
                RetryClass::Backoff if attempt < self.max_attempts => {
                    with_jitter(self.backoff(attempt, &err))
                }
                RetryClass::Once if !protocol_retried => {
                    protocol_retried = true;
                    Duration::ZERO
                }
                _ => return Err(err),
            };

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Model gateway call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Add up to 25% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::random::<u64>() % (spread + 1))
}
