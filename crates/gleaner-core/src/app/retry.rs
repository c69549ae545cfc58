//! Retry policy: decides backoff delays for content-source calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::WorkerConfig;
use crate::domain::{HarvestError, SourceError};

/// Bounded exponential backoff for one fetch step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Cap on a source-requested rate-limit wait.
    pub max_rate_limit_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.fetch_base_delay_ms),
            multiplier: config.fetch_multiplier,
            max_attempts: config.fetch_max_attempts,
            max_rate_limit_wait: Duration::from_secs(config.max_rate_limit_wait_secs),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts,
            max_rate_limit_wait: Duration::ZERO,
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        // NaN や負値は 0、表現できない大きさは Duration::MAX に丸める
        if delay_secs.is_nan() || delay_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Rate limits wait what the source asked for (capped); everything else backs off.
    pub fn delay_for(&self, error: &SourceError, attempts: u32) -> Duration {
        match error {
            SourceError::RateLimited { retry_after } => (*retry_after).min(self.max_rate_limit_wait),
            _ => self.next_delay(attempts),
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !error.is_retryable() {
                return Err(HarvestError::Source(error));
            }
            if attempts >= self.max_attempts {
                return Err(HarvestError::RetriesExhausted {
                    attempts,
                    last: error,
                });
            }
            let delay = self.delay_for(&error, attempts);
            warn!(what, attempts, ?delay, error = %error, "content source call failed; backing off");
            tokio::time::sleep(delay).await;
        }
    }
}
