use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::SharedClock;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::memory::MemoryCacheStore;
use crate::{
    CacheError, Result,
    slot::Partition,
    store::{CacheStore, QueueEntry, QueueInsert, SetAddOutcome, Subscription},
};

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

/// Testing utilities for the memory-backed cache
///
/// Wraps [`MemoryCacheStore`] and adds fault injection (outages, a number of
/// failing calls, artificial latency) plus a way to wait for queue writes to
/// land before asserting.
#[derive(Debug, Clone)]
pub struct TestCacheStore {
    inner: MemoryCacheStore,
    faults: Arc<Faults>,
    notify: Arc<Notify>,
}

impl Default for TestCacheStore {
    fn default() -> Self {
        Self::from_store(MemoryCacheStore::new())
    }
}

impl TestCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self::from_store(MemoryCacheStore::with_clock(clock))
    }

    fn from_store(inner: MemoryCacheStore) -> Self {
        Self {
            inner,
            faults: Arc::default(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// The wrapped store, bypassing any injected faults
    pub const fn inner(&self) -> &MemoryCacheStore {
        &self.inner
    }

    /// Make every call fail with [`CacheError::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail with [`CacheError::Unavailable`]
    pub fn fail_next(&self, count: usize) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock() = latency;
    }

    /// Wait until `queue` holds at least `expected` entries
    ///
    /// # Errors
    /// Returns [`CacheError::Timeout`] if the count is not reached in time
    pub async fn wait_for_queue_len(
        &self,
        queue: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.inner.queue_len(queue).await.unwrap_or_default() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| CacheError::Timeout(timeout))
    }

    async fn check(&self) -> Result<()> {
        let latency = *self.faults.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected outage".to_string()));
        }

        let failed = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CacheError::Unavailable("injected failure".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl CacheStore for TestCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.check().await?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check().await?;
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check().await?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        self.check().await?;
        self.inner.incr(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check().await?;
        self.inner.ttl(key).await
    }

    async fn set_add_bounded(
        &self,
        key: &str,
        member: &str,
        max_members: usize,
        ttl: Duration,
    ) -> Result<SetAddOutcome> {
        self.check().await?;
        self.inner
            .set_add_bounded(key, member, max_members, ttl)
            .await
    }

    async fn queue_insert(&self, queue: &str, guid: &str, payload: Vec<u8>) -> Result<QueueInsert> {
        self.check().await?;
        let inserted = self.inner.queue_insert(queue, guid, payload).await?;
        self.notify.notify_waiters();
        Ok(inserted)
    }

    async fn queue_range(&self, queue: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        self.check().await?;
        self.inner.queue_range(queue, limit).await
    }

    async fn queue_remove(&self, queue: &str, guids: &[String]) -> Result<Vec<QueueEntry>> {
        self.check().await?;
        self.inner.queue_remove(queue, guids).await
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        self.check().await?;
        self.inner.queue_len(queue).await
    }

    async fn queue_clear(&self, queue: &str) -> Result<usize> {
        self.check().await?;
        self.inner.queue_clear(queue).await
    }

    async fn partition_queues(&self, partition: Partition, limit: usize) -> Result<Vec<String>> {
        self.check().await?;
        self.inner.partition_queues(partition, limit).await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        self.check().await?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check().await?;
        self.inner.subscribe(channel).await
    }

    async fn subscribe_exclusive(&self, channel: &str) -> Result<Subscription> {
        self.check().await?;
        self.inner.subscribe_exclusive(channel).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let store = TestCacheStore::new();
        store.fail_next(2);

        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.unwrap_err().is_retryable());
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_outage_toggle() {
        let store = TestCacheStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.incr("k").await,
            Err(CacheError::Unavailable(_))
        ));

        // The inner store is reachable regardless
        assert_eq!(store.inner().incr("k").await.unwrap(), 1);

        store.set_unavailable(false);
        assert_eq!(store.incr("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_queue_len() {
        let store = TestCacheStore::new();
        let writer = store.clone();

        let handle = tokio::spawn(async move {
            for i in 0..3 {
                writer
                    .queue_insert("q", &i.to_string(), Vec::new())
                    .await
                    .unwrap();
            }
        });

        store
            .wait_for_queue_len("q", 3, Duration::from_secs(5))
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
