// rust/shardmill-core/src/storage/retry.rs

//! Retry loop for remote store requests.
//!
//! Transient failures (timeouts, throttling, 5xx) are retried with capped
//! exponential backoff plus jitter. Once retries run out the last error is
//! returned and surfaces as `StoreUnavailable`; retrying a whole sync or
//! publish step is the caller's business.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::S3Config;

/// Backoff parameters for one store client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl From<&S3Config> for RetryPolicy {
    fn from(config: &S3Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter > 0.0 {
            delay.mul_f64(1.0 + rand::rng().random_range(0.0..self.jitter))
        } else {
            delay
        }
    }

    /// Runs `request` until it succeeds, fails with an error `is_transient`
    /// rejects, or the retries are used up.
    pub async fn run<T, E, F, Fut>(
        &self,
        action: &str,
        is_transient: impl Fn(&E) -> bool,
        mut request: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retries = 0;
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(error) if retries < self.max_retries && is_transient(&error) => {
                    let delay = self.backoff(retries);
                    retries += 1;
                    tracing::debug!(
                        action,
                        retry = retries,
                        ?delay,
                        %error,
                        "retrying store request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
