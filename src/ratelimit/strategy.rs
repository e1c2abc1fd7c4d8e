//! Admission strategy trait and algorithm selection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::fixed_window::FixedWindow;
use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;
use crate::error::QuotaError;

/// Quota position of a strategy at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Admissions still available right now.
    pub remaining: u64,
    /// When the quota is next fully or partially restored.
    pub reset_at: Instant,
}

/// Trait for admission algorithms.
///
/// Implementations are plain state machines over the instant they are
/// handed. They know nothing about the operation being guarded, and the
/// read methods (`can_admit`, `state`, `wait_time`) never change what a
/// later call observes.
pub trait AdmissionStrategy: Send {
    /// Whether one more admission would be allowed at `now`.
    fn can_admit(&self, now: Instant) -> bool;

    /// Record one admission at `now`.
    ///
    /// Callers check `can_admit` first; consuming past capacity is a no-op
    /// that returns `false`.
    fn consume(&mut self, now: Instant) -> bool;

    /// Give back the admission recorded at `admitted_at`.
    ///
    /// Returns `false` and changes nothing when that admission no longer
    /// counts against the quota at `now`.
    fn refund(&mut self, admitted_at: Instant, now: Instant) -> bool;

    /// Remaining quota and reset instant at `now`.
    fn state(&self, now: Instant) -> WindowState;

    /// How long until `can_admit` turns true. Zero when it already is.
    fn wait_time(&self, now: Instant) -> Duration;

    /// Forget all admission history.
    fn reset(&mut self, now: Instant);

    /// Which algorithm this is.
    fn algorithm(&self) -> Algorithm;
}

/// The admission algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Exact rolling window over admission timestamps.
    #[default]
    SlidingWindow,
    /// Counter reset at fixed boundaries.
    FixedWindow,
    /// Continuously refilled token bucket.
    TokenBucket,
}

impl Algorithm {
    /// Build a fresh strategy instance for this algorithm.
    pub(crate) fn build(
        self,
        capacity: u64,
        window: Duration,
        now: Instant,
    ) -> Box<dyn AdmissionStrategy> {
        match self {
            Algorithm::SlidingWindow => Box::new(SlidingWindow::new(capacity, window)),
            Algorithm::FixedWindow => Box::new(FixedWindow::new(capacity, window, now)),
            Algorithm::TokenBucket => Box::new(TokenBucket::new(capacity, window, now)),
        }
    }

    /// Canonical name, as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "sliding" | "sliding-window" => Ok(Algorithm::SlidingWindow),
            "fixed" | "fixed-window" => Ok(Algorithm::FixedWindow),
            "token-bucket" | "bucket" => Ok(Algorithm::TokenBucket),
            other => Err(QuotaError::Config(format!(
                "unknown algorithm '{}', expected one of sliding-window, fixed-window, token-bucket",
                other
            ))),
        }
    }
}
