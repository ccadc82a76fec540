//! Bounded retry with linear backoff and jitter

use burrow_common::config::RetryConfig;
use burrow_common::{Result, TunnelError};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Runs an operation until it succeeds, is canceled or runs out of attempts.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based): `backoff * attempt`
    /// plus up to one `backoff` of jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff.saturating_mul(attempt);
        let jitter = self.config.backoff.mul_f64(rand::random::<f64>());
        base.saturating_add(jitter)
    }

    /// Call `op(attempt)` with `attempt` counting from 1.
    ///
    /// Returns the first success, [`TunnelError::Canceled`] as soon as `op`
    /// reports it, or the last error once `max_attempts` calls have failed.
    /// There is no delay after the final attempt.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(TunnelError::Canceled) => return Err(TunnelError::Canceled),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                debug!(attempt, "giving up: {err}");
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            debug!(attempt, ?delay, "retrying after error: {err}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
