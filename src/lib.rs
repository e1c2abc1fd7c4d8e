//! Quotaguard - in-process admission control
//!
//! This crate enforces "at most N operations per time window" around
//! arbitrary units of work. A [`Limiter`](ratelimit::Limiter) wraps one
//! stream of calls with a sliding window, fixed window or token bucket
//! strategy; a [`Registry`](registry::Registry) keeps one limiter per key
//! and evicts keys that go idle.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;

pub use crate::config::{LimiterConfig, QuotaGuardConfig, RegistryOptions};
pub use crate::error::{GuardError, QuotaError};
pub use crate::ratelimit::{Algorithm, Limiter, Snapshot};
pub use crate::registry::Registry;
