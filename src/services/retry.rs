//! Per-call timeout and bounded retry for store and source operations.
//!
//! Every backend call in a batch runs under a [`CallPolicy`]: each attempt is
//! bounded by a timeout, and failures flagged retryable are retried with
//! exponential backoff until `max_retries` is spent.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::errors::ProcessError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query(2)
    }
}

impl RetryConfig {
    /// Quick retry for individual store/source calls.
    #[must_use]
    pub fn query(max_retries: usize) -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_retries,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn fast(max_retries: usize) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl CallPolicy {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self { timeout, retry }
    }

    /// Run `operation` until it succeeds, fails terminally, or runs out of
    /// retries. A timed-out attempt counts as a retryable backend failure.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, ProcessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProcessError>>,
    {
        let mut delay = self.retry.initial_delay;
        let mut attempts = 0;

        loop {
            let result = match timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(ProcessError::backend(
                    operation_name,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                    true,
                )),
            };

            match result {
                Ok(value) => {
                    if attempts > 0 {
                        info!("{} succeeded after {} retries", operation_name, attempts);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempts < self.retry.max_retries => {
                    attempts += 1;
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation_name,
                        attempts,
                        self.retry.max_retries + 1,
                        err,
                        delay
                    );
                    sleep(delay).await;
                    delay = delay.mul_f64(self.retry.factor).min(self.retry.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
