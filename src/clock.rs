//! Time sources.
//!
//! Every expiry decision (sessions, challenges, lockouts, blocks) reads the
//! injected [`Clock`]; nothing calls `Utc::now()` directly.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never goes backwards.
///
/// A step backwards of the system time (NTP correction, manual change) is
/// absorbed by returning the last observed instant until real time catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let current = Utc::now();
        let mut last = self.last.lock();
        let now = match *last {
            Some(previous) if previous > current => previous,
            _ => current,
        };
        *last = Some(now);
        now
    }
}

/// Controllable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at a fixed, arbitrary instant (2024-01-01 12:00:00 UTC).
    #[must_use]
    pub fn at_noon() -> Self {
        let start = DateTime::from_timestamp(1_704_110_400, 0).unwrap_or_default();
        Self::new(start)
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
