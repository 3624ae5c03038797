//! Time source used by the queue engine.
//!
//! Storage operations never read the wall clock themselves; the engine passes
//! `now` down so lease expiry and retry scheduling can be driven
//! deterministically from tests.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// `at + by`, or `None` when the result leaves chrono's range.
pub fn checked_after(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

/// `at - by`, or `None` when the result leaves chrono's range.
pub fn checked_before(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves forward by `by`, stopping at the end of representable time.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = checked_after(*now, by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(10));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(10));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_checked_arithmetic_rejects_overflow() {
        let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let huge = Duration::from_secs(100_000_000_000_000);

        assert_eq!(
            checked_after(start, Duration::from_secs(5)),
            Some(start + chrono::Duration::seconds(5))
        );
        assert_eq!(
            checked_before(start, Duration::from_secs(5)),
            Some(start - chrono::Duration::seconds(5))
        );
        assert_eq!(checked_after(start, huge), None);
        assert_eq!(checked_before(start, huge), None);
        assert_eq!(checked_after(start, Duration::MAX), None);

        let clock = ManualClock::new(start);
        clock.advance(huge);
        assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    }
}
