//! Retry with exponential backoff for blocking store writes.

use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::config::StoreConfig;

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.save_retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.save_retry_initial_ms),
            max_delay: Duration::from_millis(config.save_retry_max_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or attempts run out, sleeping between tries
    ///
    /// Returns the last error when every attempt failed.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = fast_policy(3).run("save", || {
            calls += 1;
            if calls < 3 { Err("disk busy".to_string()) } else { Ok(calls) }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), String> = fast_policy(2).run("save", || {
            calls += 1;
            Err(format!("failure {}", calls))
        });
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_no_retry_runs_once() {
        let mut calls = 0;
        let _: Result<(), &str> = RetryPolicy::no_retry().run("save", || {
            calls += 1;
            Err("nope")
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&StoreConfig::default());
        assert_eq!(policy, RetryPolicy::default());
    }
}
