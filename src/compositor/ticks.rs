//! Tick timer
//!
//! Monotonic microsecond timebase divided into ticks of a configurable
//! size. Plugins drive animations from it, the event loop paces frames
//! with it.

use nix::time::{ClockId, clock_gettime};

use crate::error::CompositorError;

/// Current monotonic time in microseconds
pub fn monotonic_micros() -> Result<u64, CompositorError> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok(ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000)
}

/// Counts ticks elapsed since `start()`.
#[derive(Debug, Clone)]
pub struct TickTracker {
    running: bool,
    start_us: u64,
    tick_size_us: u64,
    observed_ticks: u64,
}

impl TickTracker {
    /// A stopped tracker with a tick size of one microsecond.
    pub fn new() -> Self {
        Self {
            running: false,
            start_us: 0,
            tick_size_us: 1,
            observed_ticks: 0,
        }
    }

    /// A stopped tracker whose ticks last `tick_size_us` microseconds.
    pub fn with_tick_size(tick_size_us: u64) -> Self {
        let mut tracker = Self::new();
        tracker.set_tick_size(tick_size_us);
        tracker
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tick_size(&self) -> u64 {
        self.tick_size_us
    }

    /// Zero-sized ticks are clamped to one microsecond.
    pub fn set_tick_size(&mut self, tick_size_us: u64) {
        self.tick_size_us = tick_size_us.max(1);
    }

    pub fn start(&mut self) -> Result<(), CompositorError> {
        let now = monotonic_micros()?;
        self.start_at(now);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Ticks since `start()`; zero while stopped.
    pub fn total_elapsed_ticks(&self) -> Result<u64, CompositorError> {
        if !self.running {
            return Ok(0);
        }
        Ok(self.total_at(monotonic_micros()?))
    }

    /// Ticks elapsed since the previous call (or since `start()`).
    pub fn new_elapsed_ticks(&mut self) -> Result<u64, CompositorError> {
        if !self.running {
            return Ok(0);
        }
        let now = monotonic_micros()?;
        Ok(self.new_at(now))
    }

    /// Microseconds until the next tick boundary; zero while stopped.
    pub fn until_next_tick(&self) -> Result<u64, CompositorError> {
        if !self.running {
            return Ok(0);
        }
        Ok(self.until_next_at(monotonic_micros()?))
    }

    pub(crate) fn start_at(&mut self, now_us: u64) {
        self.running = true;
        self.start_us = now_us;
        self.observed_ticks = 0;
    }

    pub(crate) fn total_at(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.start_us) / self.tick_size_us
    }

    pub(crate) fn until_next_at(&self, now_us: u64) -> u64 {
        let elapsed = now_us.saturating_sub(self.start_us);
        self.tick_size_us - elapsed % self.tick_size_us
    }

    pub(crate) fn new_at(&mut self, now_us: u64) -> u64 {
        let total = self.total_at(now_us).max(self.observed_ticks);
        let fresh = total - self.observed_ticks;
        self.observed_ticks = total;
        fresh
    }
}

impl Default for TickTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_tracker_reports_nothing() {
        let mut t = TickTracker::new();
        assert_eq!(t.total_elapsed_ticks().unwrap(), 0);
        assert_eq!(t.new_elapsed_ticks().unwrap(), 0);
    }

    #[test]
    fn test_ticks_follow_tick_size() {
        let mut t = TickTracker::with_tick_size(1_000);
        t.start_at(5_000);
        assert_eq!(t.total_at(5_999), 0);
        assert_eq!(t.total_at(6_000), 1);
        assert_eq!(t.total_at(15_500), 10);
    }

    #[test]
    fn test_new_ticks_sum_to_total() {
        let mut t = TickTracker::with_tick_size(250);
        t.start_at(0);
        let mut sum = 0;
        let mut last_total = 0;
        for now in [0u64, 100, 260, 900, 901, 2_000, 2_249, 7_777] {
            let total = t.total_at(now);
            assert!(total >= last_total);
            last_total = total;
            sum += t.new_at(now);
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn test_until_next_tick() {
        let mut t = TickTracker::with_tick_size(1_000);
        t.start_at(10_000);
        assert_eq!(t.until_next_at(10_000), 1_000);
        assert_eq!(t.until_next_at(10_250), 750);
        assert_eq!(t.until_next_at(12_999), 1);
        assert_eq!(t.until_next_at(13_000), 1_000);
        t.stop();
        assert_eq!(t.until_next_tick().unwrap(), 0);
    }

    #[test]
    fn test_zero_tick_size_is_clamped() {
        let t = TickTracker::with_tick_size(0);
        assert_eq!(t.tick_size(), 1);
    }

    #[test]
    fn test_real_clock_is_monotonic() {
        let mut t = TickTracker::new();
        t.start().unwrap();
        let a = t.total_elapsed_ticks().unwrap();
        let b = t.total_elapsed_ticks().unwrap();
        assert!(b >= a);
    }
}
