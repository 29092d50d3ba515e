//! The durable tier
//!
//! The sweeper hands aged envelopes to a [`DurableStore`] in batches and only
//! removes them from the cache once a batch is confirmed. The relational or
//! key-value store behind it in production lives outside this crate;
//! [`MemoryDurableStore`] stands in for it in-process.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{Envelope, MessageGuid, QueueKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DurableStoreError {
    #[error("Durable store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the batch; retrying it unchanged will not help
    #[error("Durable store rejected batch: {0}")]
    Rejected(String),
}

impl DurableStoreError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    /// Store every envelope of `batch` for `key`, or none of them. Envelopes
    /// already stored under the same guid are not duplicated.
    async fn store_batch(&self, key: &QueueKey, batch: &[Envelope]) -> Result<(), DurableStoreError>;

    /// Up to `limit` envelopes for `key` in the order they were stored,
    /// starting after `from` when given
    async fn query_by_destination(
        &self,
        key: &QueueKey,
        from: Option<&MessageGuid>,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableStoreError>;
}

#[derive(Debug, Default)]
struct Destination {
    envelopes: Vec<Envelope>,
    guids: HashSet<MessageGuid>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// In-memory durable store with failure injection and call accounting
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    destinations: Arc<DashMap<QueueKey, Destination>>,
    batch_calls: Arc<AtomicUsize>,
    faults: Arc<Faults>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store_batch` calls that succeeded
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Envelopes stored for `key`
    pub fn len(&self, key: &QueueKey) -> usize {
        self.destinations
            .get(key)
            .map_or(0, |destination| destination.envelopes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.destinations
            .iter()
            .all(|destination| destination.envelopes.is_empty())
    }

    pub fn contains(&self, key: &QueueKey, guid: &MessageGuid) -> bool {
        self.destinations
            .get(key)
            .is_some_and(|destination| destination.guids.contains(guid))
    }

    /// Make every write fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail
    pub fn fail_next(&self, count: usize) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every write by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }

    async fn check(&self) -> Result<(), DurableStoreError> {
        let latency = *self.faults.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(DurableStoreError::Unavailable("injected outage".to_string()));
        }

        let failed = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DurableStoreError::Unavailable("injected failure".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn store_batch(&self, key: &QueueKey, batch: &[Envelope]) -> Result<(), DurableStoreError> {
        self.check().await?;

        let mut destination = self.destinations.entry(*key).or_default();
        for envelope in batch {
            if destination.guids.insert(envelope.server_guid) {
                destination.envelopes.push(envelope.clone());
            }
        }
        drop(destination);

        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_by_destination(
        &self,
        key: &QueueKey,
        from: Option<&MessageGuid>,
        limit: usize,
    ) -> Result<Vec<Envelope>, DurableStoreError> {
        let Some(destination) = self.destinations.get(key) else {
            return Ok(Vec::new());
        };

        let start = from
            .and_then(|from| {
                destination
                    .envelopes
                    .iter()
                    .position(|envelope| envelope.server_guid == *from)
            })
            .map_or(0, |position| position + 1);

        Ok(destination
            .envelopes
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }
}
