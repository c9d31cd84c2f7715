//! Injected time source with a cancellable sleep.
//!
//! Everything in the scheduler that reads or sleeps on time goes through
//! [`Clock`], so tests can drive the whole dispatch loop with a
//! [`ManualClock`](crate::testing::ManualClock) instead of waiting out
//! real poll intervals.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Monotonic UTC time plus a cancellable delay.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `period` unless `cancel` fires first.
    ///
    /// Returns `true` when the full period elapsed and `false` when the
    /// sleep was interrupted by cancellation.
    async fn delay(&self, period: Duration, cancel: &CancellationToken) -> bool;
}

/// Production clock backed by `Utc::now()` and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn delay(&self, period: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }
}
