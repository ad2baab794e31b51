//! Heartbeat scheduling for held locks

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};

/// Period between keep-alive refreshes while holding a lock.
///
/// Deliberately much shorter than the store's expiry threshold (5
/// minutes against 30), so several beats can be lost to a flaky network
/// before the lock becomes reclaimable by others.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Owns the keep-alive timer for one coordinator.
///
/// Beats are meaningful only while the lock is held; the coordinator
/// skips ticks in any other state. A beat that fails on transport waits
/// for the next scheduled tick rather than retrying immediately.
pub struct HeartbeatSchedule {
    ticker: Interval,
    period: Duration,
}

impl HeartbeatSchedule {
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() yields immediately; the first beat belongs one full
        // period after acquisition
        ticker.reset();
        Self { ticker, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next beat.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Restart the schedule after a (re-)acquisition.
    pub fn restart(&mut self) {
        self.ticker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_first_tick_waits_full_period() {
        let period = Duration::from_millis(30);
        let mut schedule = HeartbeatSchedule::new(period);

        let start = Instant::now();
        schedule.tick().await;
        assert!(start.elapsed() >= period);
    }

    #[tokio::test]
    async fn test_restart_pushes_next_tick_out() {
        let period = Duration::from_millis(40);
        let mut schedule = HeartbeatSchedule::new(period);

        tokio::time::sleep(Duration::from_millis(30)).await;
        schedule.restart();

        let start = Instant::now();
        schedule.tick().await;
        // Without the restart this tick would have been ~10ms away
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
