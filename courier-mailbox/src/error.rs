//! Error types for the mailbox and the sweeper

use std::time::Duration;

use courier_cache::CacheError;
use thiserror::Error;

use crate::durable::DurableStoreError;

#[derive(Debug, Error)]
pub enum MailboxError {
    /// The transient tier could not complete the operation
    #[error("Cache store error: {0}")]
    StoreUnavailable(#[from] CacheError),

    /// The durable tier rejected or failed a batch; nothing was removed from
    /// the transient tier
    #[error("Durable write failed: {0}")]
    DurableWriteFailed(#[from] DurableStoreError),

    /// Stored bytes could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] bincode::error::DecodeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::error::EncodeError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A name in a partition index does not describe a queue
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),
}

impl MailboxError {
    /// Whether the same unit of work may succeed on a later attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(err) => err.is_retryable(),
            Self::DurableWriteFailed(err) => err.is_retryable(),
            Self::Timeout(_) => true,
            Self::Deserialization(_) | Self::Serialization(_) | Self::InvalidQueueName(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MailboxError>;

/// A sweeper configuration that cannot be used
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SweeperConfigError {
    #[error("Invalid sweeper configuration: {0} must be positive")]
    Zero(&'static str),
}
