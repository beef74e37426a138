//! Bounded retry of concurrency conflicts
//!
//! Runs on a blocking worker, so backoff sleeps the worker thread.

use crate::{config::RetryConfig, error::Result};
use prometheus::IntCounter;
use std::time::Duration;

/// Exponential backoff policy
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    conflicts: Option<IntCounter>,
}

impl RetryPolicy {
    /// Create from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            conflicts: None,
        }
    }

    /// Count retried conflicts on `counter`
    pub fn with_conflict_counter(mut self, counter: IntCounter) -> Self {
        self.conflicts = Some(counter);
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op`, repeating it while it fails with a retryable error
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Concurrency conflict, retrying"
                    );
                    if let Some(counter) = &self.conflicts {
                        counter.inc();
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}
