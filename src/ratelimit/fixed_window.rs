//! Fixed window counter.

use std::time::{Duration, Instant};

use super::strategy::{AdmissionStrategy, Algorithm, WindowState};

/// A counter that resets at fixed window boundaries.
///
/// The window restarts at the first call made after the previous one ran
/// out; nothing carries over. Up to twice the capacity can be admitted
/// across a short span straddling a boundary.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    capacity: u64,
    window: Duration,
    /// When the current window started
    window_start: Instant,
    /// Admissions in the current window
    count: u64,
}

impl FixedWindow {
    /// Create a counter whose first window starts at `now`.
    pub fn new(capacity: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            window_start: now,
            count: 0,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.window_start + self.window
    }

    /// Window start and count as they would be after a rollover check.
    fn effective(&self, now: Instant) -> (Instant, u64) {
        if self.expired(now) {
            (now, 0)
        } else {
            (self.window_start, self.count)
        }
    }

    /// Reset the window if it has expired.
    fn maybe_reset_window(&mut self, now: Instant) {
        if self.expired(now) {
            self.window_start = now;
            self.count = 0;
        }
    }

    /// Admissions counted in the current window.
    pub fn current_count(&self, now: Instant) -> u64 {
        self.effective(now).1
    }
}

impl AdmissionStrategy for FixedWindow {
    fn can_admit(&self, now: Instant) -> bool {
        self.effective(now).1 < self.capacity
    }

    fn consume(&mut self, now: Instant) -> bool {
        self.maybe_reset_window(now);
        if self.count >= self.capacity {
            return false;
        }
        self.count += 1;
        true
    }

    fn refund(&mut self, admitted_at: Instant, now: Instant) -> bool {
        // Only admissions counted in the current window can be given back.
        if self.expired(now) || admitted_at < self.window_start || self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    fn state(&self, now: Instant) -> WindowState {
        let (start, count) = self.effective(now);
        WindowState {
            remaining: self.capacity.saturating_sub(count),
            reset_at: start + self.window,
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        let (start, count) = self.effective(now);
        if count < self.capacity {
            Duration::ZERO
        } else {
            (start + self.window).saturating_duration_since(now)
        }
    }

    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.count = 0;
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
