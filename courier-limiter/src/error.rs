//! Error types for rate limiting

use std::time::Duration;

use thiserror::Error;

/// The caller must wait before the operation is admitted.
///
/// This is the only user-visible error of the limiters; store trouble never
/// surfaces here because checks fail open.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Rate limit exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    #[must_use]
    pub const fn new(retry_after: Duration) -> Self {
        Self { retry_after }
    }
}

/// A limiter configuration that cannot be used
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration for rate limiter {name}: {reason}")]
    Invalid { name: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, reason: &str) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}
