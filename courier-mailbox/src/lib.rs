//! Transient message queues
//!
//! Envelopes for a device wait in a per-device queue in the shared cache
//! until the device acknowledges them. A reader subscribes to its queue to
//! hear about new envelopes, and at most one reader per queue is live: a new
//! subscription displaces the previous one.
//!
//! Queues are not meant to hold envelopes for long. The [`Sweeper`] moves
//! anything older than the persist delay into a [`DurableStore`], deleting it
//! from the cache only after the durable write succeeded.

mod durable;
mod envelope;
mod error;
mod queue;
mod sweeper;

pub use durable::{DurableStore, DurableStoreError, MemoryDurableStore};
pub use envelope::{Envelope, EnvelopeType, MessageGuid};
pub use error::{MailboxError, Result, SweeperConfigError};
pub use queue::{MessagesCache, PersistenceLock, QueueEvent, QueueKey, QueueSubscription};
pub use sweeper::{
    CycleReport, DEFAULT_CURSOR_KEY, QueueReport, ShardCursor, Sweeper, SweeperConfig,
};
