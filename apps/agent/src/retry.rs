//! Exponential backoff for homeserver calls.

use std::future::Future;
use std::time::Duration;

use mxagent_shared::error::MxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before try number `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, MxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MxError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(operation = what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
