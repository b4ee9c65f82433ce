//! Retry policy with exponential backoff.
//!
//! The policy itself never sleeps; callers ask [`Backoff`] for the next delay
//! and wait however suits them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How failed I/O is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure (ms)
    pub initial_delay_ms: u64,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Upper bound on any single delay (ms)
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff { policy: self.clone(), attempts: 0 }
    }
}

/// Consecutive-failure counter for one retrying operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Record a failure. Returns the delay to wait, or `None` once the
    /// policy's attempt budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        match self.policy.max_attempts {
            Some(max) if self.attempts > max => None,
            _ => Some(self.policy.delay_for(self.attempts)),
        }
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 3_000,
            max_attempts: None,
        };
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
    }

    #[test]
    fn backoff_gives_up_after_max_attempts() {
        let policy = RetryPolicy { max_attempts: Some(2), ..Default::default() };
        let mut backoff = policy.backoff();
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_none());
    }

    #[test]
    fn success_resets_the_curve() {
        let mut backoff = RetryPolicy::default().backoff();
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_success();
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(1_000)));
    }
}
