//! Error types for cache operations.

use std::time::Duration;

use thiserror::Error;

/// Failure talking to, or interpreting data held by, the cache cluster.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache (or the node owning the key) could not be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value has a shape the operation cannot work with.
    #[error("Invalid value stored at {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Internal error (lock poisoning, closed channels, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Returns `true` if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Specialized `Result` type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CacheError::Unavailable("node down".to_string()).is_retryable());
        assert!(CacheError::Timeout(Duration::from_millis(50)).is_retryable());
        assert!(
            !CacheError::InvalidValue {
                key: "k".to_string(),
                reason: "not an integer".to_string(),
            }
            .is_retryable()
        );
        assert!(!CacheError::Internal("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::InvalidValue {
            key: "cursor".to_string(),
            reason: "not an integer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value stored at cursor: not an integer"
        );
    }
}
