//! Bounded exponential backoff.
//!
//! Used for opening database sessions and for requeueing reconciliations
//! that failed with a transient error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::sleep;

/// Exponential delay schedule capped at a maximum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a schedule starting at `base` and never exceeding `max`.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
    /// capped at the maximum.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Runs `operation` up to `attempts` times, sleeping between failures
    /// for which `is_transient` holds. Permanent failures and the last
    /// transient failure are returned as-is.
    ///
    /// # Errors
    ///
    /// Returns the final error from `operation`.
    pub async fn retry<T, E, F, Fut>(
        &self,
        attempts: u32,
        is_transient: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    tracing::debug!(attempt, ?delay, "transient failure, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Per-key failure counters feeding [`Backoff::delay`].
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `key` and returns how many failures preceded it.
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = failures.entry(key.to_owned()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    /// Forgets the failures recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}
