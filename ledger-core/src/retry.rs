//! Retry policy: exponential backoff with jitter for transient store errors
//!
//! Timeouts and outages draw from `max_retries`. Lost conditional writes
//! draw from the separate `max_conflict_retries` budget.

use crate::config::RetryConfig;
use crate::error::StoreError;
use prometheus::IntCounter;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Transient errors outlasted the budget
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last_error: StoreError,
    },
    /// Non-transient error, not retried
    Fatal(StoreError),
}

/// Exponential backoff executor
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries: Option<IntCounter>,
}

impl RetryPolicy {
    /// Create from config
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retries: None,
        }
    }

    /// Count every retry on `counter`
    pub fn with_counter(mut self, counter: IntCounter) -> Self {
        self.retries = Some(counter);
        self
    }

    /// Delay before the nth retry (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt.min(32) as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` until it succeeds, fails fatally, or exhausts the budget
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempts: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut conflicts: u32 = 0;

        loop {
            attempts += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(
                            operation = operation_name,
                            attempts, "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    warn!(operation = operation_name, error = %e, "Non-retryable store error");
                    return Err(RetryError::Fatal(e));
                }
                Err(e) => e,
            };

            let (used, budget, backoff_step) = if error.is_conflict() {
                conflicts += 1;
                (conflicts, self.config.max_conflict_retries, conflicts.min(4) - 1)
            } else {
                transient_failures += 1;
                (transient_failures, self.config.max_retries, transient_failures - 1)
            };

            if used > budget {
                tracing::error!(
                    operation = operation_name,
                    attempts,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts,
                    last_error: error,
                });
            }

            let delay = self.delay_for(backoff_step);
            warn!(
                operation = operation_name,
                attempt = attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Transient store error, retrying"
            );
            if let Some(ref counter) = self.retries {
                counter.inc();
            }
            tokio::time::sleep(delay).await;
        }
    }
}
