//! Wall-clock source shared by the rate limiter and the entry store.

use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

/// Source of the current UTC time
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn test_mock_clock() {
        let fixed = Utc.with_ymd_and_hms(2025, 12, 22, 0, 0, 0).unwrap();
        let mut clock = MockClock::new();
        clock.expect_now().times(1).return_const(fixed);
        assert_eq!(clock.now(), fixed);
    }
}
