//! Cancellable periodic timer driving the optimizer control loops.

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest period a ticker accepts; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct Ticker {
    interval: Interval,
    cancel: CancellationToken,
}

impl Ticker {
    /// Ticker whose first tick fires one `period` from now.
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let period = period.max(MIN_PERIOD);
        Self::build(Instant::now() + period, period, cancel)
    }

    /// Ticker whose first tick fires immediately.
    pub fn immediate(period: Duration, cancel: CancellationToken) -> Self {
        Self::build(Instant::now(), period.max(MIN_PERIOD), cancel)
    }

    fn build(start: Instant, period: Duration, cancel: CancellationToken) -> Self {
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, cancel }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Wait for the next tick. Returns false once the ticker was stopped.
    ///
    /// Cancel safe, so it can sit in a `tokio::select!` branch.
    pub async fn tick(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
