use std::time::Duration;

use anyhow::{bail, Result};
use rand::Rng;
use tokio::time::Instant;

/// Per-job tick timing.
///
/// The first tick is delayed by a uniform random offset in `[0, interval)`.
/// Every following tick is due `interval` after the previous tick started;
/// an overrunning tick makes the next one due immediately, without
/// accumulating missed ticks.
pub struct TickSchedule {
    interval: Duration,
    last_start: Option<Instant>,
    ticks: u64,
}

impl std::fmt::Debug for TickSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickSchedule")
            .field("interval", &self.interval)
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl TickSchedule {
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            bail!("tick interval must be > 0");
        }

        Ok(Self {
            interval,
            last_start: None,
            ticks: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Changes the interval; the next due time is derived from the new value.
    pub fn set_interval(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            bail!("tick interval must be > 0");
        }
        self.interval = interval;
        Ok(())
    }

    /// Instant at which the next tick should start.
    pub fn next_due(&self, now: Instant) -> Instant {
        match self.last_start {
            None => now + jitter(self.interval),
            Some(start) => {
                let due = start + self.interval;
                if due <= now {
                    now
                } else {
                    due
                }
            }
        }
    }

    /// Records that a tick started at `now`.
    pub fn mark_started(&mut self, now: Instant) {
        self.last_start = Some(now);
        self.ticks += 1;
    }
}

/// Uniform random offset in `[0, interval)`.
pub fn jitter(interval: Duration) -> Duration {
    let nanos = interval.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_interval() {
        let result = TickSchedule::new(Duration::ZERO);
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("interval"));
    }

    #[test]
    fn test_jitter_within_interval() {
        let interval = Duration::from_secs(10);
        for _ in 0..1000 {
            assert!(jitter(interval) < interval);
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_is_jittered() {
        let schedule = TickSchedule::new(Duration::from_secs(60)).expect("valid interval");
        let now = Instant::now();
        let due = schedule.next_due(now);
        assert!(due >= now);
        assert!(due < now + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_due_subtracts_elapsed() {
        let mut schedule = TickSchedule::new(Duration::from_secs(10)).expect("valid interval");
        let start = Instant::now();
        schedule.mark_started(start);

        let later = start + Duration::from_secs(3);
        assert_eq!(schedule.next_due(later), start + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_fires_immediately_without_catch_up() {
        let mut schedule = TickSchedule::new(Duration::from_secs(10)).expect("valid interval");
        let start = Instant::now();
        schedule.mark_started(start);

        let late = start + Duration::from_secs(35);
        assert_eq!(schedule.next_due(late), late);

        schedule.mark_started(late);
        assert_eq!(
            schedule.next_due(late + Duration::from_secs(1)),
            late + Duration::from_secs(10)
        );
        assert_eq!(schedule.ticks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_applies_to_pending_tick() {
        let mut schedule = TickSchedule::new(Duration::from_secs(10)).expect("valid interval");
        let start = Instant::now();
        schedule.mark_started(start);

        schedule
            .set_interval(Duration::from_secs(1))
            .expect("valid interval");
        let now = start + Duration::from_millis(200);
        assert_eq!(schedule.next_due(now), start + Duration::from_secs(1));
        assert!(schedule.set_interval(Duration::ZERO).is_err());
    }
}
