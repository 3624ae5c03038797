//! Retry policy for failed jobs.
//!
//! Implements exponential backoff: `base * 2^(attempt - 1)`, capped.

use crate::clock::checked_after;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after the failure of 1-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// When the next attempt may run, given the failure of `attempt` at `now`.
    /// `None` if that instant is beyond the representable range.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> Option<DateTime<Utc>> {
        checked_after(now, self.delay_for_attempt(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}
