//! Bounded retry with exponential backoff and jitter.
//!
//! Only transient failures ([`HarnessError::is_transient`]) are retried:
//! - backend unreachable, HTTP 429, HTTP 5xx → retry
//! - HTTP 4xx (not 429), embedding and storage errors → fail immediately
//!
//! Delay before attempt `n` (1-based, after the first) is
//! `min(base × 2^(n-2), max)` scaled by a random factor in `[0.5, 1.0]`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Classify an HTTP status from a collaborator the way the retry loop
/// expects: 429 and 5xx are transient, any other failure is a rejection.
pub fn classify_status(
    stage: crate::error::Stage,
    status: reqwest::StatusCode,
    body: &str,
) -> HarnessError {
    let message = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());
    if status.as_u16() == 429 || status.is_server_error() {
        HarnessError::unavailable(stage, message)
    } else {
        HarnessError::rejected(stage, message)
    }
}
