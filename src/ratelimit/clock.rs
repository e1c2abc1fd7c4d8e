//! Time sources for admission decisions.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A source of the current instant.
///
/// Strategies never read the time themselves; the limiter asks its clock
/// once per call and passes the instant down.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Monotonic system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Useful for tests and simulations that need exact window boundaries.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    current: Mutex<Instant>,
}

impl ManualClock {
    /// Create a clock frozen at the current system instant.
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            current: Mutex::new(origin),
        }
    }

    /// The instant this clock started at.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Time elapsed since the origin.
    pub fn elapsed(&self) -> Duration {
        self.current.lock().duration_since(self.origin)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Jump to `origin + offset`. May move backwards.
    pub fn set_elapsed(&self, offset: Duration) {
        *self.current.lock() = self.origin + offset;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}
