//! Error types for quotaguard.

use std::time::Duration;
use thiserror::Error;

/// Error type for configuration and construction.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for configuration and construction.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Outcome of a guarded call that did not produce a value.
///
/// `E` is whatever the wrapped operation fails with. It is carried through
/// untouched in [`GuardError::Operation`].
#[derive(Error, Debug)]
pub enum GuardError<E> {
    /// The limiter rejected the call before the operation started.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    LimitExceeded {
        /// How long to wait before an admission can succeed.
        retry_after: Duration,
    },

    /// The operation ran and failed.
    #[error("Wrapped operation failed: {0}")]
    Operation(E),

    /// The registry has been destroyed and no longer accepts calls.
    #[error("Registry has been destroyed")]
    Destroyed,
}

impl<E> GuardError<E> {
    /// Returns the retry hint if this is a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::LimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns `true` if the limiter rejected the call.
    pub fn is_limited(&self) -> bool {
        matches!(self, GuardError::LimitExceeded { .. })
    }

    /// Unwraps the operation's own error, if that is what this is.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            GuardError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
