//! Wall-clock source, injectable so expiry and rotation schedules can be
//! driven deterministically.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The operating system clock.
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
    /// Start the clock at `start`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward (or backward, for a negative delta).
    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Render an instant the way the store persists timestamps: Unix millis.
#[must_use]
pub fn to_millis_string(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

/// Parse a persisted Unix-millis timestamp.
#[must_use]
pub fn from_millis_str(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = DateTime::from_timestamp_millis(1_000).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::seconds(5));
        assert_eq!(clock.now().timestamp_millis(), 6_000);
    }

    #[test]
    fn manual_clock_set() {
        let clock = ManualClock::new(DateTime::from_timestamp_millis(0).unwrap());
        let later = DateTime::from_timestamp_millis(42).unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn millis_roundtrip() {
        let at = DateTime::from_timestamp_millis(1_717_171_717_171).unwrap();
        assert_eq!(from_millis_str(&to_millis_string(at)), Some(at));
    }

    #[test]
    fn millis_rejects_garbage() {
        assert_eq!(from_millis_str("yesterday"), None);
        assert_eq!(from_millis_str(""), None);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now().timestamp() > 1_577_836_800);
    }
}
