//! Limiter: admission, execution and refund in one call.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::observer::{LimiterObserver, NoopObserver};
use super::strategy::{AdmissionStrategy, Algorithm};
use crate::config::LimiterConfig;
use crate::error::{GuardError, Result};

/// Point-in-time view of a limiter. Derived, never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Admissions available right now
    pub remaining: u64,
    /// When quota is next restored
    #[serde(skip)]
    pub reset_at: Instant,
    /// Whether the next call would be rejected
    pub limited: bool,
    /// How long until the next call can be admitted
    #[serde(serialize_with = "serialize_millis", rename = "retry_after_ms")]
    pub retry_after: Duration,
    /// Admissions since construction or the last reset
    pub total_admitted: u64,
}

fn serialize_millis<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Mutable state guarded by the limiter's lock.
struct LimiterState {
    config: LimiterConfig,
    strategy: Box<dyn AdmissionStrategy>,
    total_admitted: u64,
    /// Bumped whenever history is discarded, so stale refunds can be dropped
    generation: u64,
}

/// Receipt for one admission, settled after the operation finishes.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    at: Instant,
}

/// Guards a stream of operations with one admission strategy.
///
/// The admission check and the consumption happen in one critical section,
/// and the wrapped operation runs after the lock is released, so a slow or
/// failing operation never holds up other callers.
pub struct Limiter {
    state: Mutex<LimiterState>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LimiterObserver>,
}

impl Limiter {
    /// Create a limiter on the system clock.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, clock, Arc::new(NoopObserver)))
    }

    /// Build from a configuration that has already passed validation.
    pub(crate) fn from_validated(
        config: LimiterConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn LimiterObserver>,
    ) -> Self {
        let strategy = config.algorithm.build(config.capacity, config.window, clock.now());
        trace!(
            algorithm = %config.algorithm,
            capacity = config.capacity,
            window_ms = config.window.as_millis() as u64,
            "Creating limiter"
        );
        Self {
            state: Mutex::new(LimiterState {
                config,
                strategy,
                total_admitted: 0,
                generation: 0,
            }),
            clock,
            observer,
        }
    }

    /// Attach an observer for state transitions.
    pub fn with_observer(mut self, observer: Arc<dyn LimiterObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run `operation` if admitted.
    ///
    /// Fails with [`GuardError::LimitExceeded`] without polling the operation
    /// when no quota is left. Otherwise the admission is recorded before the
    /// operation starts, and its error, if any, comes back unchanged in
    /// [`GuardError::Operation`].
    pub async fn guard<F, Fut, T, E>(
        &self,
        operation: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let admission = self
            .admit()
            .map_err(|retry_after| GuardError::LimitExceeded { retry_after })?;
        let result = operation().await;
        self.settle(admission, result.is_ok());
        result.map_err(GuardError::Operation)
    }

    /// Synchronous variant of [`guard`](Self::guard).
    pub fn guard_sync<F, T, E>(&self, operation: F) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let admission = self
            .admit()
            .map_err(|retry_after| GuardError::LimitExceeded { retry_after })?;
        let result = operation();
        self.settle(admission, result.is_ok());
        result.map_err(GuardError::Operation)
    }

    /// Whether a call made now would be admitted. Changes nothing.
    pub fn can_admit(&self) -> bool {
        let now = self.clock.now();
        self.state.lock().strategy.can_admit(now)
    }

    /// Current quota position.
    pub fn snapshot(&self) -> Snapshot {
        let now = self.clock.now();
        let state = self.state.lock();
        build_snapshot(&state, now)
    }

    /// Discard admission history. Operations already admitted are unaffected
    /// and their refunds, if any, are dropped.
    pub fn reset(&self) {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            state.strategy.reset(now);
            state.total_admitted = 0;
            state.generation += 1;
        }
        debug!("Limiter reset");
        self.observer.on_reset();
    }

    /// Swap in a new configuration, discarding admission history.
    ///
    /// The configuration is validated first; on error nothing changes.
    pub fn reconfigure(&self, config: LimiterConfig) -> Result<()> {
        config.validate()?;
        let now = self.clock.now();
        let strategy = config.algorithm.build(config.capacity, config.window, now);
        {
            let mut state = self.state.lock();
            debug!(
                from = %state.config.algorithm,
                to = %config.algorithm,
                capacity = config.capacity,
                window_ms = config.window.as_millis() as u64,
                "Reconfiguring limiter"
            );
            state.strategy = strategy;
            state.config = config;
            state.total_admitted = 0;
            state.generation += 1;
        }
        self.observer.on_reset();
        Ok(())
    }

    /// The active configuration.
    pub fn config(&self) -> LimiterConfig {
        self.state.lock().config.clone()
    }

    /// The active algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.state.lock().strategy.algorithm()
    }

    /// Check and consume in one critical section.
    ///
    /// Returns the retry hint on rejection.
    fn admit(&self) -> std::result::Result<Admission, Duration> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if !state.strategy.can_admit(now) {
            let retry_after = state.strategy.wait_time(now);
            drop(state);
            debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            self.observer.on_limited(retry_after);
            return Err(retry_after);
        }

        state.strategy.consume(now);
        state.total_admitted += 1;
        let remaining = state.strategy.state(now).remaining;
        let admission = Admission {
            generation: state.generation,
            at: now,
        };
        drop(state);

        trace!(remaining = remaining, "Admitted");
        self.observer.on_admitted(remaining);
        Ok(admission)
    }

    /// Apply the configured refund policy once the operation has finished.
    fn settle(&self, admission: Admission, succeeded: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let refund = if succeeded {
            state.config.refund_on_success
        } else {
            state.config.refund_on_failure
        };
        if !refund {
            return;
        }
        if state.generation != admission.generation {
            debug!(
                succeeded = succeeded,
                "Dropping refund for an admission made before the last reset"
            );
            return;
        }

        if !state.strategy.refund(admission.at, now) {
            debug!(
                succeeded = succeeded,
                held_ms = now.saturating_duration_since(admission.at).as_millis() as u64,
                "Dropping refund for an admission that no longer counts"
            );
            return;
        }
        trace!(
            succeeded = succeeded,
            remaining = state.strategy.state(now).remaining,
            "Refunded admission"
        );
    }
}

fn build_snapshot(state: &LimiterState, now: Instant) -> Snapshot {
    let window = state.strategy.state(now);
    let limited = !state.strategy.can_admit(now);
    Snapshot {
        remaining: window.remaining,
        reset_at: window.reset_at,
        limited,
        retry_after: if limited {
            state.strategy.wait_time(now)
        } else {
            Duration::ZERO
        },
        total_admitted: state.total_admitted,
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Limiter")
            .field("config", &state.config)
            .field("total_admitted", &state.total_admitted)
            .finish()
    }
}
