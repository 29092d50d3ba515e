//! The clustered, hash-sharded cache that holds transient mailbox state.
//!
//! The real deployment talks to a cluster of key-value nodes; this crate
//! fixes the operations the rest of courier relies on ([`CacheStore`]) and
//! ships an in-process implementation of them.

pub mod backends;
pub mod error;
pub mod slot;
pub mod store;

pub use backends::{MemoryCacheStore, TestCacheStore};
pub use error::{CacheError, Result};
pub use slot::{PARTITION_COUNT, Partition, key_slot};
pub use store::{CacheStore, QueueEntry, QueueInsert, SetAddOutcome, Subscription};
