use std::sync::Arc;

use courier_cache::{CacheStore, Partition};

use crate::Result;

/// Key of the shared cursor in the cache
pub const DEFAULT_CURSOR_KEY: &str = "persist_shard_cursor";

/// The sweeper's position in the partition rotation
///
/// The position lives in the shared cache as an ever-increasing counter, so a
/// restarted sweeper continues where the previous one stopped, and several
/// sweepers sharing one cache split the rotation between them instead of
/// repeating each other's partitions.
#[derive(Debug, Clone)]
pub struct ShardCursor {
    store: Arc<dyn CacheStore>,
    key: String,
}

impl ShardCursor {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_key(store, DEFAULT_CURSOR_KEY)
    }

    pub fn with_key(store: Arc<dyn CacheStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Claim the next partition to sweep
    ///
    /// # Errors
    ///
    /// Returns an error if the counter could not be advanced; no partition is
    /// claimed in that case.
    pub async fn advance(&self) -> Result<Partition> {
        let counter = self.store.incr(&self.key).await?;
        Ok(Partition::from_counter(counter.wrapping_sub(1)))
    }

    /// The partition the next [`ShardCursor::advance`] will claim
    ///
    /// # Errors
    ///
    /// Returns an error if the counter could not be read.
    pub async fn peek(&self) -> Result<Partition> {
        let counter = self
            .store
            .get(&self.key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Partition::from_counter(counter))
    }

    /// Point the cursor at `partition`
    ///
    /// # Errors
    ///
    /// Returns an error if the counter could not be written.
    pub async fn reset(&self, partition: Partition) -> Result<()> {
        self.store
            .set(&self.key, partition.index().to_string().into_bytes(), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_cache::{MemoryCacheStore, PARTITION_COUNT};

    use super::*;

    #[tokio::test]
    async fn test_advances_one_partition_at_a_time() {
        let cursor = ShardCursor::new(Arc::new(MemoryCacheStore::new()));

        assert_eq!(cursor.peek().await.unwrap().index(), 0);
        assert_eq!(cursor.advance().await.unwrap().index(), 0);
        assert_eq!(cursor.advance().await.unwrap().index(), 1);
        assert_eq!(cursor.peek().await.unwrap().index(), 2);
    }

    #[tokio::test]
    async fn test_wraps_around() {
        let cursor = ShardCursor::new(Arc::new(MemoryCacheStore::new()));
        let last = Partition::new(PARTITION_COUNT - 1).unwrap();

        cursor.reset(last).await.unwrap();
        assert_eq!(cursor.advance().await.unwrap(), last);
        assert_eq!(cursor.advance().await.unwrap().index(), 0);
    }

    #[tokio::test]
    async fn test_position_survives_a_new_cursor() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let first = ShardCursor::new(store.clone());
        first.advance().await.unwrap();
        first.advance().await.unwrap();

        let restarted = ShardCursor::new(store);
        assert_eq!(restarted.advance().await.unwrap().index(), 2);
    }
}
