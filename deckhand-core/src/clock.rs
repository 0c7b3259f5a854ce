//! Wall-clock abstraction used for expiry arithmetic.
//!
//! Deadlines embedded in backend rows are Unix seconds, so scheduling needs
//! "now" in Unix time rather than a monotonic instant. Tests substitute a
//! clock driven by the runtime's virtual time.

use chrono::Utc;
use std::fmt;

/// Source of the current Unix time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current Unix time in milliseconds.
    fn now_unix_ms(&self) -> i64;

    /// Current Unix time in whole seconds.
    fn now_unix_secs(&self) -> i64 {
        self.now_unix_ms().div_euclid(1000)
    }
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_close_to_chrono() {
        let clock = SystemClock;
        let before = Utc::now().timestamp_millis();
        let now = clock.now_unix_ms();
        let after = Utc::now().timestamp_millis();
        assert!(now >= before && now <= after);
    }

    #[derive(Debug)]
    struct Fixed(i64);

    impl Clock for Fixed {
        fn now_unix_ms(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_secs_round_down() {
        assert_eq!(Fixed(1_700_000_000_999).now_unix_secs(), 1_700_000_000);
        assert_eq!(Fixed(-1).now_unix_secs(), -1);
    }
}
