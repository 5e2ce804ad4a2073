//! Keeps the most recent position fix available to other tasks.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Fix, PositionSource};

/// Pause after a transport error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct TimedFix {
    fix: Fix,
    received: Instant,
}

/// Read side of the latest-fix channel
#[derive(Debug, Clone)]
pub struct PositionTracker {
    rx: watch::Receiver<Option<TimedFix>>,
}

impl PositionTracker {
    /// Poll `source` on a background task, publishing every fix
    ///
    /// The task ends once every tracker clone has been dropped.
    pub fn spawn<P: PositionSource + 'static>(mut source: P) -> (PositionTracker, JoinHandle<()>) {
        let (tx, rx) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut fixes: u64 = 0;

            while !tx.is_closed() {
                match source.next_fix().await {
                    Ok(Some(fix)) => {
                        fixes += 1;
                        if fixes == 1 {
                            info!("First GNSS fix: {:.5}, {:.5}", fix.latitude, fix.longitude);
                        } else {
                            debug!("GNSS fix: {:.5}, {:.5}", fix.latitude, fix.longitude);
                        }
                        tx.send_replace(Some(TimedFix { fix, received: Instant::now() }));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("GNSS read failed: {}", e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }

            info!("Position tracker stopped after {} fix(es)", fixes);
        });

        (PositionTracker { rx }, task)
    }

    /// The latest fix, if one arrived within `max_age`
    pub fn latest(&self, max_age: Duration) -> Option<Fix> {
        let current = *self.rx.borrow();
        current
            .filter(|timed| timed.received.elapsed() <= max_age)
            .map(|timed| timed.fix)
    }
}
