//! Injectable time source.

use chrono::{DateTime, Datelike, Local, Utc};

/// Supplies the current time and turns file timestamps into years.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar year used for `year` destinations.
    fn year_of(&self, timestamp: DateTime<Utc>) -> i32;
}

/// Wall clock; years are taken in the local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn year_of(&self, timestamp: DateTime<Utc>) -> i32 {
        timestamp.with_timezone(&Local).year()
    }
}

/// A clock frozen at one instant, with years taken in UTC.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn year_of(&self, timestamp: DateTime<Utc>) -> i32 {
        timestamp.year()
    }
}
