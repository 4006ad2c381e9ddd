//! Randomized election timer and periodic heartbeat ticker (§4.3, §4.5).
//!
//! Grounded on the teacher's timer-reset discipline in
//! `handle_append_entries_request` (`update_next_election_timeout`): a timer
//! is a plain `Sleep` that gets reset rather than recreated, so restarting it
//! costs no allocation on the hot path of every heartbeat.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio::time::Sleep;

/// A timer that fires once after a duration drawn uniformly from
/// `[min_ms, max_ms)`, and can be reset to draw a fresh duration without
/// being recreated.
///
/// Used for the follower/candidate heartbeat timeout and the candidate's
/// re-election spacing window (§4.3): both are "redraw on every reset"
/// timers, just with different ranges.
pub struct RandomizedTimer {
    min_ms: u64,
    max_ms: u64,
    sleep: std::pin::Pin<Box<Sleep>>,
    suspended: bool,
}

impl RandomizedTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        let mut timer = Self {
            min_ms,
            max_ms,
            sleep: Box::pin(sleep(Duration::from_millis(min_ms))),
            suspended: false,
        };
        timer.reset();
        timer
    }

    fn random_duration(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..self.max_ms);
        Duration::from_millis(ms)
    }

    /// Redraw and restart the timer from now.
    pub fn reset(&mut self) {
        self.suspended = false;
        self.sleep.as_mut().reset(Instant::now() + self.random_duration());
    }

    /// Suspend the timer: `elapsed()` never resolves until `reset()` is
    /// called again. Used while a commit is in flight (§4.3 step 4:
    /// "suspend the heartbeat timer ... then restart it").
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.sleep.as_mut().reset(Instant::now() + Duration::from_secs(3600 * 24));
    }

    /// Resolves when the randomized duration elapses. Cancel-safe: callers
    /// select! against this alongside other branches.
    pub async fn elapsed(&mut self) {
        if self.suspended {
            std::future::pending::<()>().await;
        }
        (&mut self.sleep).await
    }
}

/// A fixed-interval ticker for leader heartbeats / per-peer AppendEntries
/// pacing (§4.5 `appendEntriesIntervalMS`).
pub struct HeartbeatTicker {
    interval: tokio::time::Interval,
}

impl HeartbeatTicker {
    pub fn new(interval_ms: u64) -> Self {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Restart the interval from now, e.g. right after sending an
    /// AppendEntries outside the regular schedule (§4.5 "send; restart
    /// timer").
    pub fn restart(&mut self, interval_ms: u64) {
        self.interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        self.interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn randomized_timer_fires_within_range() {
        let mut timer = RandomizedTimer::new(10, 20);
        let start = Instant::now();
        timer.elapsed().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(9), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_blocks_until_reset() {
        let mut timer = RandomizedTimer::new(5, 6);
        timer.suspend();
        let raced = tokio::time::timeout(Duration::from_millis(50), timer.elapsed()).await;
        assert!(raced.is_err(), "suspended timer must not fire");
        timer.reset();
        tokio::time::timeout(Duration::from_millis(50), timer.elapsed())
            .await
            .expect("timer fires after reset");
    }
}
