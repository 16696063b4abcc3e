// =============================================================================
// Clock abstraction — injectable wall-clock time
// =============================================================================
//
// The scheduler's daily lifecycle (pre-market, day-open close, post-market)
// is gated on wall-clock time in the exchange's zone. Production uses the
// system clock; tests inject a manual clock and step it through the day.
//
// The process is expected to run with its local zone set to Asia/Shanghai
// (CST, no DST) — all fixed times below are interpreted in that zone.

use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use parking_lot::RwLock;

/// Source of "now" for all time-gated logic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    fn time_of_day(&self) -> NaiveTime {
        self.now().time()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, now: DateTime<Local>) {
        *self.now.write() = now;
    }

    /// Advance by a duration.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.read()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_set_and_advance() {
        let start = Local.with_ymd_and_hms(2026, 2, 9, 14, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 2, 9).unwrap());

        clock.advance(chrono::Duration::minutes(35));
        assert_eq!(
            clock.time_of_day(),
            NaiveTime::from_hms_opt(15, 5, 0).unwrap()
        );

        let next_day = Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap();
        clock.set(next_day);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
    }
}
