//! The transient message queue
//!
//! Each destination device has an ordered queue in the clustered cache.
//! Producers append, a live connection peeks and acknowledges, and the
//! [`crate::Sweeper`] migrates what nobody picked up in time. Ordering and
//! atomicity come from the store's own queue operations; nothing here takes
//! an application-level lock.

mod events;
mod key;

use std::{sync::Arc, time::Duration};

use courier_cache::{CacheStore, Partition, QueueEntry};
pub use events::{QueueEvent, QueueSubscription};
pub use key::QueueKey;
use ulid::Ulid;

use crate::{Envelope, MessageGuid, Result};

/// An envelope as read from a queue, or the guid of an entry that could not
/// be decoded.
pub(crate) enum Peeked {
    Envelope(Envelope),
    Corrupt(String),
}

/// Held while a queue is being migrated; see
/// [`MessagesCache::lock_for_persistence`]
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct PersistenceLock {
    key: QueueKey,
    token: String,
}

impl PersistenceLock {
    pub const fn key(&self) -> &QueueKey {
        &self.key
    }
}

#[derive(Debug, Clone)]
pub struct MessagesCache {
    store: Arc<dyn CacheStore>,
}

pub(crate) fn record_removed(reason: &'static str, count: usize) {
    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics
            .mailbox
            .record_removed(reason, u64::try_from(count).unwrap_or(u64::MAX));
    }
}

impl MessagesCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Queue `envelope` for `key` under a freshly assigned guid
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    pub async fn insert(&self, key: &QueueKey, envelope: Envelope) -> Result<MessageGuid> {
        self.insert_with_guid(key, MessageGuid::generate(), envelope)
            .await
    }

    /// Queue `envelope` under a caller-chosen guid. Retrying with the same
    /// guid never queues the envelope twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    #[tracing::instrument(level = "trace", skip(self, envelope), fields(queue = %key))]
    pub async fn insert_with_guid(
        &self,
        key: &QueueKey,
        guid: MessageGuid,
        mut envelope: Envelope,
    ) -> Result<MessageGuid> {
        envelope.server_guid = guid;
        envelope.server_timestamp = 0;
        let ephemeral = envelope.ephemeral;

        let inserted = self
            .store
            .queue_insert(&key.queue_name(), &guid.to_string(), envelope.to_bytes()?)
            .await?;

        if inserted.duplicate {
            tracing::debug!(queue = %key, %guid, "Envelope already queued");
            return Ok(guid);
        }

        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.mailbox.record_inserted(ephemeral);
        }

        // The envelope is queued; a lost notification only delays delivery
        // until the reader's next poll
        if let Err(err) = self.publish(key, QueueEvent::NewMessages).await {
            tracing::warn!(queue = %key, error = %err, "Failed to publish new message notification");
        }

        Ok(guid)
    }

    /// Up to `limit` oldest envelopes, without removing them. Entries that
    /// cannot be decoded are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    pub async fn peek(&self, key: &QueueKey, limit: usize) -> Result<Vec<Envelope>> {
        Ok(self
            .peek_entries(key, limit)
            .await?
            .into_iter()
            .filter_map(|(_, peeked)| match peeked {
                Peeked::Envelope(envelope) => Some(envelope),
                Peeked::Corrupt(_) => None,
            })
            .collect())
    }

    /// Raw peek for the sweeper: every entry with its server timestamp,
    /// corrupt ones included so they can be cleaned up
    pub(crate) async fn peek_entries(
        &self,
        key: &QueueKey,
        limit: usize,
    ) -> Result<Vec<(u64, Peeked)>> {
        let entries = self.store.queue_range(&key.queue_name(), limit).await?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.server_timestamp, decode(key, entry)))
            .collect())
    }

    /// Remove one envelope, returning it if it was still queued
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    pub async fn remove(&self, key: &QueueKey, guid: &MessageGuid) -> Result<Option<Envelope>> {
        Ok(self
            .remove_all(key, std::slice::from_ref(guid))
            .await?
            .into_iter()
            .next())
    }

    /// Remove envelopes by guid, returning those that were still queued.
    /// Unknown guids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    #[tracing::instrument(level = "trace", skip(self, guids), fields(queue = %key, count = guids.len()))]
    pub async fn remove_all(&self, key: &QueueKey, guids: &[MessageGuid]) -> Result<Vec<Envelope>> {
        let guids: Vec<String> = guids.iter().map(ToString::to_string).collect();
        let removed = self.remove_raw(key, &guids).await?;
        record_removed("acknowledged", removed.len());

        Ok(removed
            .into_iter()
            .filter_map(|entry| match decode(key, entry) {
                Peeked::Envelope(envelope) => Some(envelope),
                Peeked::Corrupt(_) => None,
            })
            .collect())
    }

    pub(crate) async fn remove_raw(&self, key: &QueueKey, guids: &[String]) -> Result<Vec<QueueEntry>> {
        if guids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self.store.queue_remove(&key.queue_name(), guids).await?)
    }

    /// Drop the whole queue, returning how many envelopes it held
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    pub async fn clear(&self, key: &QueueKey) -> Result<usize> {
        let cleared = self.store.queue_clear(&key.queue_name()).await?;
        record_removed("cleared", cleared);
        Ok(cleared)
    }

    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    pub async fn has_messages(&self, key: &QueueKey) -> Result<bool> {
        Ok(self.len(key).await? > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    pub async fn len(&self, key: &QueueKey) -> Result<usize> {
        Ok(self.store.queue_len(&key.queue_name()).await?)
    }

    /// Up to `limit` active queue names in `partition`, longest waiting first
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    pub async fn queue_names_in_partition(
        &self,
        partition: Partition,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(self.store.partition_queues(partition, limit).await?)
    }

    /// Subscribe to `key`'s events, displacing any earlier subscriber
    ///
    /// Earlier subscribers are told who displaced them and their
    /// subscriptions are then closed, so one that is too far behind to
    /// receive the announcement still stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription could not be registered.
    pub async fn subscribe(&self, key: &QueueKey) -> Result<QueueSubscription> {
        let id = Ulid::new();

        let displaced = self.publish(key, QueueEvent::Displaced { by: id }).await?;
        if displaced > 0
            && let Some(metrics) = courier_metrics::try_metrics()
        {
            metrics.mailbox.record_displaced();
        }

        let subscription = self.store.subscribe_exclusive(&key.channel()).await?;

        Ok(QueueSubscription::new(*key, id, subscription))
    }

    /// Tell a live reader that envelopes were moved to durable storage
    ///
    /// # Errors
    ///
    /// Returns an error if the notification could not be published.
    pub async fn notify_persisted(&self, key: &QueueKey) -> Result<()> {
        self.publish(key, QueueEvent::MessagesPersisted).await?;
        Ok(())
    }

    async fn publish(&self, key: &QueueKey, event: QueueEvent) -> Result<usize> {
        let delivered = self.store.publish(&key.channel(), event.to_bytes()?).await?;

        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.mailbox.record_notification(event.kind());
        }

        Ok(delivered)
    }

    /// Mark `key` as being migrated. Returns `None` if someone else already
    /// holds the mark. The mark lapses after `ttl` even if never released.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    pub async fn lock_for_persistence(
        &self,
        key: &QueueKey,
        ttl: Duration,
    ) -> Result<Option<PersistenceLock>> {
        let token = Ulid::new().to_string();

        let acquired = self
            .store
            .set_nx(&key.lock_key(), token.clone().into_bytes(), ttl)
            .await?;

        Ok(acquired.then_some(PersistenceLock { key: *key, token }))
    }

    /// Release `lock`. Returns `false` if it had already lapsed; a mark taken
    /// by someone else since then is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be written.
    pub async fn unlock_for_persistence(&self, lock: PersistenceLock) -> Result<bool> {
        Ok(self
            .store
            .delete_if_equals(&lock.key.lock_key(), lock.token.as_bytes())
            .await?)
    }

    /// Whether a migration of `key` is in progress
    ///
    /// # Errors
    ///
    /// Returns an error if the cache could not be read.
    pub async fn is_persisting(&self, key: &QueueKey) -> Result<bool> {
        Ok(self.store.get(&key.lock_key()).await?.is_some())
    }
}

fn decode(key: &QueueKey, entry: QueueEntry) -> Peeked {
    match Envelope::from_bytes(&entry.payload) {
        Ok(mut envelope) => {
            envelope.server_timestamp = entry.server_timestamp;
            Peeked::Envelope(envelope)
        }
        Err(err) => {
            tracing::error!(
                queue = %key,
                guid = %entry.guid,
                error = %err,
                "Queued envelope could not be decoded"
            );
            Peeked::Corrupt(entry.guid)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_cache::MemoryCacheStore;
    use uuid::Uuid;

    use super::*;
    use crate::EnvelopeType;

    fn cache() -> (MessagesCache, MemoryCacheStore) {
        let store = MemoryCacheStore::new();
        (MessagesCache::new(Arc::new(store.clone())), store)
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new(EnvelopeType::Ciphertext, body.as_bytes())
    }

    #[tokio::test]
    async fn test_insert_assigns_server_metadata() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);

        let mut submitted = envelope("hi");
        submitted.server_timestamp = 1;
        let guid = cache.insert(&key, submitted.clone()).await.unwrap();

        let peeked = cache.peek(&key, 10).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].server_guid, guid);
        assert_ne!(peeked[0].server_guid, submitted.server_guid);
        assert!(peeked[0].server_timestamp > 1);
        assert_eq!(peeked[0].content, b"hi");
    }

    #[tokio::test]
    async fn test_peek_is_ordered_and_bounded() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);

        for i in 0..5 {
            cache.insert(&key, envelope(&i.to_string())).await.unwrap();
        }

        let bodies: Vec<_> = cache
            .peek(&key, 3)
            .await
            .unwrap()
            .into_iter()
            .map(|e| String::from_utf8(e.content).unwrap())
            .collect();
        assert_eq!(bodies, ["0", "1", "2"]);
        assert_eq!(cache.len(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_peek_empty_queue() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);

        assert!(cache.peek(&key, 10).await.unwrap().is_empty());
        assert!(!cache.has_messages(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_retried_insert_is_idempotent() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let guid = MessageGuid::generate();

        cache.insert_with_guid(&key, guid, envelope("a")).await.unwrap();
        cache.insert_with_guid(&key, guid, envelope("a")).await.unwrap();

        assert_eq!(cache.len(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let guid = cache.insert(&key, envelope("a")).await.unwrap();

        let removed = cache.remove(&key, &guid).await.unwrap();
        assert_eq!(removed.map(|e| e.server_guid), Some(guid));

        assert!(cache.remove(&key, &guid).await.unwrap().is_none());
        assert!(
            cache
                .remove(&key, &MessageGuid::generate())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_last_removal_leaves_partition_index() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let first = cache.insert(&key, envelope("a")).await.unwrap();
        let second = cache.insert(&key, envelope("b")).await.unwrap();

        let names = cache
            .queue_names_in_partition(key.partition(), 10)
            .await
            .unwrap();
        assert_eq!(names, [key.queue_name()]);

        let removed = cache.remove_all(&key, &[first, second]).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(
            cache
                .queue_names_in_partition(key.partition(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_corrupt_entries_are_skipped() {
        let (cache, store) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);

        store
            .queue_insert(&key.queue_name(), "garbage", vec![0xff; 3])
            .await
            .unwrap();
        cache.insert(&key, envelope("ok")).await.unwrap();

        let peeked = cache.peek(&key, 10).await.unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].content, b"ok");
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);
        cache.insert(&key, envelope("a")).await.unwrap();
        cache.insert(&key, envelope("b")).await.unwrap();

        assert_eq!(cache.clear(&key).await.unwrap(), 2);
        assert!(!cache.has_messages(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_persistence_lock() {
        let (cache, _) = cache();
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let ttl = Duration::from_secs(30);

        assert!(!cache.is_persisting(&key).await.unwrap());
        let lock = cache.lock_for_persistence(&key, ttl).await.unwrap().unwrap();
        assert_eq!(lock.key(), &key);
        assert!(cache.lock_for_persistence(&key, ttl).await.unwrap().is_none());
        assert!(cache.is_persisting(&key).await.unwrap());

        assert!(cache.unlock_for_persistence(lock).await.unwrap());
        assert!(!cache.is_persisting(&key).await.unwrap());
    }
}
