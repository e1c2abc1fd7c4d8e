//! Synchronous lifecycle notifications.

use std::time::Duration;

/// Receives limiter state transitions.
///
/// Every method runs on the caller's thread right after the transition is
/// committed and after the limiter's lock is released, so an observer may
/// read the limiter it is attached to. All methods default to no-ops.
///
/// Notifications from one thread arrive in the order of that thread's
/// transitions. Across threads there is no ordering guarantee: two callers
/// racing on one limiter may deliver their notifications in the opposite
/// order to the one in which the lock committed them, so a `remaining`
/// value can be older than one already seen.
pub trait LimiterObserver: Send + Sync {
    /// An admission was recorded; `remaining` is the quota left afterwards.
    fn on_admitted(&self, remaining: u64) {
        let _ = remaining;
    }

    /// A call was rejected before it started.
    fn on_limited(&self, retry_after: Duration) {
        let _ = retry_after;
    }

    /// Admission history was discarded by `reset` or `reconfigure`.
    fn on_reset(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LimiterObserver for NoopObserver {}

/// Receives state transitions for every key in a registry.
///
/// Delivery follows the same rules as [`LimiterObserver`], so events for
/// one key may interleave out of order across threads.
pub trait KeyedObserver: Send + Sync {
    /// An admission was recorded for `key`.
    fn on_admitted(&self, key: &str, remaining: u64) {
        let _ = (key, remaining);
    }

    /// A call for `key` was rejected before it started.
    fn on_limited(&self, key: &str, retry_after: Duration) {
        let _ = (key, retry_after);
    }

    /// The limiter for `key` was reset.
    fn on_reset(&self, key: &str) {
        let _ = key;
    }

    /// The entry for `key` was evicted for being idle.
    fn on_evicted(&self, key: &str) {
        let _ = key;
    }
}
