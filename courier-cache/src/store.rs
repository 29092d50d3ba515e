use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Result, slot::Partition};

/// Number of undelivered notifications buffered per subscriber before
/// further notifications are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// One entry of an ordered queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Per-queue insertion sequence, strictly increasing
    pub sequence: u64,
    /// Caller supplied unique id of the entry
    pub guid: String,
    /// Milliseconds since the epoch, assigned by the store on insert and
    /// never decreasing along a queue
    pub server_timestamp: u64,
    pub payload: Arc<[u8]>,
}

/// Result of inserting into a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInsert {
    pub sequence: u64,
    pub server_timestamp: u64,
    /// The guid was already queued; nothing was written
    pub duplicate: bool,
}

/// Result of adding a member to a bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAddOutcome {
    /// The member was already in the set
    Present { cardinality: usize },
    /// The member was added
    Added { cardinality: usize },
    /// The set is full; the member was not added
    Rejected {
        cardinality: usize,
        expires_in: Duration,
    },
}

/// A live subscription to a notification channel.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Arc<[u8]>>,
}

impl Subscription {
    #[must_use]
    pub const fn new(channel: String, receiver: mpsc::Receiver<Arc<[u8]>>) -> Self {
        Self { channel, receiver }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next notification. Returns `None` once the publisher side
    /// has gone away.
    pub async fn recv(&mut self) -> Option<Arc<[u8]>> {
        self.receiver.recv().await
    }

    /// Take a pending notification without waiting
    pub fn try_recv(&mut self) -> Option<Arc<[u8]>> {
        self.receiver.try_recv().ok()
    }
}

/// Operations the clustered cache provides.
///
/// Every method is a single atomic operation from the point of view of other
/// callers: no caller ever observes a half-applied insert or removal. Queue
/// operations locate the queue's partition with [`crate::key_slot`] on the
/// queue name.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Fetch a plain value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a plain value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key is absent. Returns whether it was stored.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Remove a plain value or set. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove a plain value only if it currently equals `expected`
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Increment the integer stored at `key` (absent counts as zero) and
    /// return the new value
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Remaining time to live of a value or set, `None` if the key is absent
    /// or never expires
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Add `member` to the set at `key` unless that would grow it beyond
    /// `max_members`. A newly created set expires after `ttl`; adding to an
    /// existing set never extends its lifetime.
    async fn set_add_bounded(
        &self,
        key: &str,
        member: &str,
        max_members: usize,
        ttl: Duration,
    ) -> Result<SetAddOutcome>;

    /// Append to the queue, creating it and registering it in its partition's
    /// active-queue index if needed. Inserting a guid that is already queued
    /// is a no-op that reports the existing entry.
    async fn queue_insert(&self, queue: &str, guid: &str, payload: Vec<u8>) -> Result<QueueInsert>;

    /// Up to `limit` oldest entries, in sequence order, without removing them
    async fn queue_range(&self, queue: &str, limit: usize) -> Result<Vec<QueueEntry>>;

    /// Remove entries by guid, returning those that were present. Unknown
    /// guids are ignored. A queue left empty leaves its partition index.
    async fn queue_remove(&self, queue: &str, guids: &[String]) -> Result<Vec<QueueEntry>>;

    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Drop the whole queue, returning how many entries it held
    async fn queue_clear(&self, queue: &str) -> Result<usize>;

    /// Up to `limit` active queue names in `partition`, longest registered first
    async fn partition_queues(&self, partition: Partition, limit: usize) -> Result<Vec<String>>;

    /// Publish to every current subscriber of `channel`, returning how many
    /// subscribers received it
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Subscribe to `channel` and close every earlier subscription to it.
    /// Closed subscriptions still yield what was buffered before they end.
    async fn subscribe_exclusive(&self, channel: &str) -> Result<Subscription>;
}
