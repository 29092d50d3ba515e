use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{SharedClock, SystemClock};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    CacheError, Result,
    slot::{Partition, key_slot},
    store::{CacheStore, QueueEntry, QueueInsert, SUBSCRIPTION_BUFFER, SetAddOutcome, Subscription},
};

/// A value with an optional absolute expiry, in clock milliseconds.
#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<u64>,
}

impl<T> Expiring<T> {
    const fn new(value: T, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn remaining(&self, now: u64) -> Option<Duration> {
        self.expires_at
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_sequence: u64,
    last_timestamp: u64,
    entries: BTreeMap<u64, QueueEntry>,
    sequences: HashMap<String, u64>,
}

/// Active queues of one partition, ordered by registration time.
#[derive(Debug, Default)]
struct PartitionIndex {
    registered: HashMap<String, u64>,
    order: BTreeSet<(u64, String)>,
}

impl PartitionIndex {
    fn register(&mut self, queue: &str, at: u64) {
        if !self.registered.contains_key(queue) {
            self.registered.insert(queue.to_string(), at);
            self.order.insert((at, queue.to_string()));
        }
    }

    fn deregister(&mut self, queue: &str) {
        if let Some(at) = self.registered.remove(queue) {
            self.order.remove(&(at, queue.to_string()));
        }
    }

    fn oldest(&self, limit: usize) -> Vec<String> {
        self.order
            .iter()
            .take(limit)
            .map(|(_, queue)| queue.clone())
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    clock: SharedClock,
    values: DashMap<String, Expiring<Vec<u8>>>,
    sets: DashMap<String, Expiring<HashSet<String>>>,
    queues: DashMap<String, QueueState>,
    index: DashMap<Partition, PartitionIndex>,
    channels: DashMap<String, Vec<mpsc::Sender<Arc<[u8]>>>>,
}

/// In-memory cache store
///
/// Keeps every structure in sharded concurrent maps. Each queue lives behind
/// its own map entry, so operations on one queue are serialised while
/// operations on different queues proceed in parallel. Expired values are
/// removed lazily the next time they are touched.
///
/// Cloning is cheap and clones share the same data, which makes it easy to
/// hand one store to a producer, a consumer and the sweeper in tests.
#[derive(Debug, Clone)]
pub struct MemoryCacheStore {
    inner: Arc<Inner>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    /// Create an empty store running on the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Create an empty store reading time from `clock`
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                values: DashMap::new(),
                sets: DashMap::new(),
                queues: DashMap::new(),
                index: DashMap::new(),
                channels: DashMap::new(),
            }),
        }
    }

    /// Number of non-empty queues held by the store
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.now()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }

    fn live_value(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.now();
        let value = self.inner.values.get(key)?;
        if value.is_live(now) {
            return Some(value.value.clone());
        }
        drop(value);

        self.inner.values.remove_if(key, |_, v| !v.is_live(now));
        None
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| self.expiry(ttl));
        self.inner
            .values
            .insert(key.to_string(), Expiring::new(value, expires_at));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let now = self.now();
        let expires_at = Some(self.expiry(ttl));

        let mut entry = self
            .inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(Vec::new(), Some(now)));

        // A freshly created placeholder is already expired, as is any stale value
        if entry.is_live(now) {
            return Ok(false);
        }

        *entry = Expiring::new(value, expires_at);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.now();
        let value = self
            .inner
            .values
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now));
        let set = self
            .inner
            .sets
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now));

        Ok(value || set)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = self.now();
        Ok(self
            .inner
            .values
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let now = self.now();
        let mut entry = self
            .inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(b"0".to_vec(), None));

        let current = if entry.is_live(now) {
            std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| CacheError::InvalidValue {
                    key: key.to_string(),
                    reason: "value is not an unsigned integer".to_string(),
                })?
        } else {
            entry.expires_at = None;
            0
        };

        let next = current.wrapping_add(1);
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.now();

        if let Some(value) = self.inner.values.get(key)
            && value.is_live(now)
        {
            return Ok(value.remaining(now));
        }

        Ok(self
            .inner
            .sets
            .get(key)
            .filter(|set| set.is_live(now))
            .and_then(|set| set.remaining(now)))
    }

    async fn set_add_bounded(
        &self,
        key: &str,
        member: &str,
        max_members: usize,
        ttl: Duration,
    ) -> Result<SetAddOutcome> {
        let now = self.now();
        let expires_at = Some(self.expiry(ttl));

        let mut set = self
            .inner
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashSet::new(), expires_at));

        if !set.is_live(now) {
            *set = Expiring::new(HashSet::new(), expires_at);
        }

        let cardinality = set.value.len();
        if set.value.contains(member) {
            return Ok(SetAddOutcome::Present { cardinality });
        }

        if cardinality >= max_members {
            return Ok(SetAddOutcome::Rejected {
                cardinality,
                expires_in: set.remaining(now).unwrap_or(ttl),
            });
        }

        set.value.insert(member.to_string());
        Ok(SetAddOutcome::Added {
            cardinality: cardinality + 1,
        })
    }

    async fn queue_insert(&self, queue: &str, guid: &str, payload: Vec<u8>) -> Result<QueueInsert> {
        let now = self.now();
        let mut state = self.inner.queues.entry(queue.to_string()).or_default();

        if let Some(existing) = state
            .sequences
            .get(guid)
            .and_then(|sequence| state.entries.get(sequence))
        {
            return Ok(QueueInsert {
                sequence: existing.sequence,
                server_timestamp: existing.server_timestamp,
                duplicate: true,
            });
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let server_timestamp = now.max(state.last_timestamp);
        state.last_timestamp = server_timestamp;

        state.sequences.insert(guid.to_string(), sequence);
        state.entries.insert(
            sequence,
            QueueEntry {
                sequence,
                guid: guid.to_string(),
                server_timestamp,
                payload: Arc::from(payload),
            },
        );

        self.inner
            .index
            .entry(key_slot(queue))
            .or_default()
            .register(queue, server_timestamp);

        Ok(QueueInsert {
            sequence,
            server_timestamp,
            duplicate: false,
        })
    }

    async fn queue_range(&self, queue: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        Ok(self
            .inner
            .queues
            .get(queue)
            .map(|state| state.entries.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_remove(&self, queue: &str, guids: &[String]) -> Result<Vec<QueueEntry>> {
        let Some(mut state) = self.inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let removed: Vec<QueueEntry> = guids
            .iter()
            .filter_map(|guid| {
                let sequence = state.sequences.remove(guid)?;
                state.entries.remove(&sequence)
            })
            .collect();

        if state.entries.is_empty() {
            if let Some(mut index) = self.inner.index.get_mut(&key_slot(queue)) {
                index.deregister(queue);
            }
            drop(state);
            self.inner
                .queues
                .remove_if(queue, |_, state| state.entries.is_empty());
        }

        Ok(removed)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        Ok(self
            .inner
            .queues
            .get(queue)
            .map_or(0, |state| state.entries.len()))
    }

    async fn queue_clear(&self, queue: &str) -> Result<usize> {
        let mut cleared = 0;

        // Deregister under the queue's entry lock so a concurrent insert
        // cannot re-register in between
        self.inner.queues.remove_if(queue, |_, state| {
            if let Some(mut index) = self.inner.index.get_mut(&key_slot(queue)) {
                index.deregister(queue);
            }
            cleared = state.entries.len();
            true
        });

        Ok(cleared)
    }

    async fn partition_queues(&self, partition: Partition, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .inner
            .index
            .get(&partition)
            .map(|index| index.oldest(limit))
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let Some(mut subscribers) = self.inner.channels.get_mut(channel) else {
            return Ok(0);
        };

        let payload: Arc<[u8]> = Arc::from(payload);
        let mut delivered = 0;

        subscribers.retain(|subscriber| match subscriber.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(channel, "Subscriber is not keeping up, notification dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        let empty = subscribers.is_empty();
        drop(subscribers);
        if empty {
            self.inner
                .channels
                .remove_if(channel, |_, subscribers| subscribers.is_empty());
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(sender);

        Ok(Subscription::new(channel.to_string(), receiver))
    }

    async fn subscribe_exclusive(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let replaced = self
            .inner
            .channels
            .insert(channel.to_string(), vec![sender]);

        if let Some(replaced) = replaced
            && !replaced.is_empty()
        {
            tracing::debug!(channel, closed = replaced.len(), "Closed earlier subscriptions");
        }

        Ok(Subscription::new(channel.to_string(), receiver))
    }
}
