//! Test support: a hand-driven clock and small helpers.
//!
//! These live in the library (not behind `cfg(test)`) so integration
//! tests and downstream crates can drive the scheduler deterministically.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// A clock that only moves when the test advances it.
///
/// `delay` waiters park on a notify and re-check the deadline after every
/// [`advance`](Self::advance), so a runner sleeping out its poll interval
/// wakes the moment the test moves time past it.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    tick: Notify,
}

impl Default for ManualClock {
    fn default() -> Self {
        // An arbitrary fixed epoch; tests only care about relative motion.
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            tick: Notify::new(),
        }
    }

    /// Move time forward and wake every parked `delay`.
    pub fn advance(&self, period: Duration) {
        {
            let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
            *now += chrono::Duration::from_std(period).unwrap_or(chrono::TimeDelta::MAX);
        }
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self, period: Duration, cancel: &CancellationToken) -> bool {
        let deadline =
            self.now() + chrono::Duration::from_std(period).unwrap_or(chrono::TimeDelta::MAX);
        loop {
            if self.now() >= deadline {
                return true;
            }
            // Arm the waiter before re-reading time so an advance between
            // the check and the await is not lost.
            let notified = self.tick.notified();
            if self.now() >= deadline {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = notified => {}
            }
        }
    }
}
