//! # Rate Limiter
//!
//! Fixed-window gate deciding whether a reading may be persisted.
//!
//! Only the leading edge of each window is admitted: once a reading is
//! accepted, every reading in the following `window` is rejected and dropped.
//! Nothing is queued or smoothed.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Fixed-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    /// `None` until the first reading is accepted
    last_accepted_at: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimiter {
    /// Create a limiter admitting one reading per `window`
    ///
    /// A zero window admits every reading not older than the last accepted
    /// one.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted_at: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept the reading arriving at `now` if a full window has passed
    ///
    /// The comparison and the update happen under one lock, so two
    /// concurrent callers can never both be admitted into the same window.
    /// A `now` earlier than the last acceptance is a negative gap and is
    /// rejected.
    pub fn try_accept(&self, now: DateTime<Utc>) -> bool {
        let mut last = self.lock();
        self.decide(&mut last, now)
    }

    /// Like [`try_accept`](Self::try_accept), reading `clock` while holding
    /// the lock
    ///
    /// Concurrent callers are then decided in the order their times were
    /// taken, so a caller that read the clock earlier can never be admitted
    /// after one that read it later.
    pub fn try_accept_now(&self, clock: &dyn Clock) -> bool {
        let mut last = self.lock();
        let now = clock.now();
        self.decide(&mut last, now)
    }

    /// Time of the last accepted reading
    pub fn last_accepted_at(&self) -> Option<DateTime<Utc>> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_accepted_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decide(&self, last: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let accept = match *last {
            None => true,
            Some(prev) if now < prev => {
                warn!("Reading at {} precedes last accepted reading at {}, rejecting", now, prev);
                false
            }
            Some(prev) => (now - prev).to_std().map_or(false, |elapsed| elapsed >= self.window),
        };

        if accept {
            *last = Some(now);
        } else {
            debug!("Rate limited: last accepted at {:?}, window {:?}", *last, self.window);
        }

        accept
    }
}
