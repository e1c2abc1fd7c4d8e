//! Sliding window log.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

use super::strategy::{AdmissionStrategy, Algorithm, WindowState};

/// Exact rolling window over admission timestamps.
///
/// An admission at `t` counts against every interval `(now - window, now]`
/// that contains it, so no window-length interval ever holds more than
/// `capacity` admissions and there is no boundary burst.
///
/// # Refunds
///
/// A refund retracts the timestamp recorded for the refunded admission,
/// even when later admissions interleaved. An admission that has already
/// aged out of the window is not refunded, since it no longer holds any
/// quota. After a backwards clock step, recorded timestamps may be later
/// than the admission instant, and the retracted entry may then be a
/// neighbour's.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: u64,
    window: Duration,
    /// Ascending admission instants, at most `capacity` long
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            timestamps: VecDeque::with_capacity(capacity.min(1024) as usize),
        }
    }

    fn is_live(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) < self.window
    }

    /// Index of the first timestamp still inside the window.
    fn first_live(&self, now: Instant) -> usize {
        self.timestamps.partition_point(|&t| !self.is_live(t, now))
    }

    fn live_count(&self, now: Instant) -> u64 {
        (self.timestamps.len() - self.first_live(now)) as u64
    }

    fn oldest_live(&self, now: Instant) -> Option<Instant> {
        self.timestamps.get(self.first_live(now)).copied()
    }

    fn purge(&mut self, now: Instant) {
        let expired = self.first_live(now);
        if expired > 0 {
            self.timestamps.drain(..expired);
        }
    }
}

impl AdmissionStrategy for SlidingWindow {
    fn can_admit(&self, now: Instant) -> bool {
        self.live_count(now) < self.capacity
    }

    fn consume(&mut self, now: Instant) -> bool {
        self.purge(now);
        if self.timestamps.len() as u64 >= self.capacity {
            return false;
        }
        // A clock that stepped backwards must not break the ordering.
        let at = match self.timestamps.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.timestamps.push_back(at);
        true
    }

    fn refund(&mut self, admitted_at: Instant, now: Instant) -> bool {
        self.purge(now);
        if !self.is_live(admitted_at, now) {
            return false;
        }
        let index = self.timestamps.partition_point(|&t| t < admitted_at);
        match self.timestamps.remove(index) {
            Some(dropped) => {
                trace!(
                    age_ms = now.saturating_duration_since(dropped).as_millis() as u64,
                    "Retracted sliding window admission"
                );
                true
            }
            None => false,
        }
    }

    fn state(&self, now: Instant) -> WindowState {
        WindowState {
            remaining: self.capacity.saturating_sub(self.live_count(now)),
            reset_at: self
                .oldest_live(now)
                .map_or(now + self.window, |oldest| oldest + self.window),
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        if self.can_admit(now) {
            return Duration::ZERO;
        }
        match self.oldest_live(now) {
            Some(oldest) => self
                .window
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    fn reset(&mut self, _now: Instant) {
        self.timestamps.clear();
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }
}
