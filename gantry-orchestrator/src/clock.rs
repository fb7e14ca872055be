//! Time source
//!
//! Leases, backoff deadlines and retention windows all read the current time
//! through [`Clock`] so tests can move time explicitly.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
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

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += to_chrono(by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Converts a std duration for timestamp arithmetic, capped at 100 years
pub fn to_chrono(d: Duration) -> chrono::Duration {
    const CAP_DAYS: i64 = 36_500;
    chrono::Duration::from_std(d)
        .unwrap_or_else(|_| chrono::Duration::days(CAP_DAYS))
        .min(chrono::Duration::days(CAP_DAYS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(35));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(35));
    }

    #[test]
    fn test_to_chrono_caps_huge_durations() {
        let d = to_chrono(Duration::from_secs(u64::MAX));
        assert_eq!(d, chrono::Duration::days(36_500));
    }
}
