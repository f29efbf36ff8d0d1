//! Error types for Ratewise.

use std::time::Duration;
use thiserror::Error;

/// Outcome of a dispatched call that did not succeed.
///
/// Every variant is absorbed into limiter state before it reaches the caller;
/// none of them is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// The vendor answered with a 429-class response or a message that reads
    /// like one.
    #[error("rate limit exceeded (retry after {retry_after:?})")]
    RateLimitExceeded {
        /// Server-advertised wait, when one was sent
        retry_after: Option<Duration>,
    },

    /// Network error or non-429 failure status.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// The circuit breaker refused the call; it was never attempted.
    #[error("circuit open, call not attempted")]
    CircuitOpenRejection,

    /// The request window is full; the call was never attempted.
    #[error("request window full, retry in {retry_in:?}")]
    Deferred {
        /// Suggested wait before asking again
        retry_in: Duration,
    },
}

impl CallError {
    /// Whether the call reached the vendor at all.
    pub fn was_attempted(&self) -> bool {
        !matches!(
            self,
            CallError::CircuitOpenRejection | CallError::Deferred { .. }
        )
    }
}

/// Main error type for Ratewise operations.
#[derive(Error, Debug)]
pub enum RatewiseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dispatch errors
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatewiseError {
    fn from(err: config::ConfigError) -> Self {
        RatewiseError::Config(err.to_string())
    }
}

/// Result type alias for Ratewise operations.
pub type Result<T> = std::result::Result<T, RatewiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_errors_were_not_attempted() {
        assert!(!CallError::CircuitOpenRejection.was_attempted());
        assert!(!CallError::Deferred {
            retry_in: Duration::from_secs(1)
        }
        .was_attempted());
        assert!(CallError::TransientFailure("boom".to_string()).was_attempted());
        assert!(CallError::RateLimitExceeded { retry_after: None }.was_attempted());
    }

    #[test]
    fn test_call_error_converts_into_crate_error() {
        let err: RatewiseError = CallError::CircuitOpenRejection.into();
        assert_eq!(err.to_string(), "Call error: circuit open, call not attempted");
    }
}
