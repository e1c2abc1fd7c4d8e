//! Token bucket.

use std::time::{Duration, Instant};

use super::strategy::{AdmissionStrategy, Algorithm, WindowState};

/// A bucket of `capacity` tokens refilled continuously.
///
/// The bucket refills at `capacity / window`, so an idle bucket goes from
/// empty to full in exactly one window. It starts full, which permits a
/// burst of `capacity` admissions before settling into the refill rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    window: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Token level at `now`, without storing it.
    fn refilled(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        // Scale by the window fraction so a full idle window lands exactly on capacity.
        let added = elapsed.as_secs_f64() / self.window.as_secs_f64() * self.capacity as f64;
        (self.tokens + added).min(self.capacity as f64)
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.refilled(now);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Fractional token level at `now`.
    pub fn tokens(&self, now: Instant) -> f64 {
        self.refilled(now)
    }

    fn millis_to_fill(&self, deficit: f64) -> Duration {
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        let window_ms = self.window.as_secs_f64() * 1000.0;
        Duration::from_millis((deficit * window_ms / self.capacity as f64).ceil() as u64)
    }
}

impl AdmissionStrategy for TokenBucket {
    fn can_admit(&self, now: Instant) -> bool {
        self.refilled(now) >= 1.0
    }

    fn consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        true
    }

    fn refund(&mut self, _admitted_at: Instant, now: Instant) -> bool {
        self.refill(now);
        let capacity = self.capacity as f64;
        if self.tokens >= capacity {
            return false;
        }
        self.tokens = (self.tokens + 1.0).min(capacity);
        true
    }

    fn state(&self, now: Instant) -> WindowState {
        let tokens = self.refilled(now);
        WindowState {
            remaining: tokens.floor() as u64,
            reset_at: now + self.millis_to_fill(self.capacity as f64 - tokens),
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        self.millis_to_fill(1.0 - self.refilled(now))
    }

    fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity as f64;
        self.last_refill = now;
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
