//! Per-key exponential backoff for failed reconciles

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Shortest retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Longest retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Calculate exponential backoff delay for a retry attempt
///
/// `base * 2^attempt`, capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(31));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Tracks consecutive failures per key
#[derive(Debug)]
pub struct RateLimiter<T> {
    failures: HashMap<T, u32>,
    base: Duration,
    max: Duration,
}

impl<T: Eq + Hash + Clone> RateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: HashMap::new(),
            base,
            max,
        }
    }

    /// Delay before the next retry of `key`; counts one more failure.
    pub fn when(&mut self, key: &T) -> Duration {
        let attempt = self.failures.entry(key.clone()).or_insert(0);
        let delay = calculate_backoff(*attempt, self.base, self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Clear the failure history of `key` after a success.
    pub fn forget(&mut self, key: &T) {
        self.failures.remove(key);
    }

    pub fn retries(&self, key: &T) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl<T: Eq + Hash + Clone> Default for RateLimiter<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
