#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_cache::{
    CacheStore, MemoryCacheStore, PARTITION_COUNT, Partition, TestCacheStore, key_slot,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_every_active_queue_is_reachable_through_some_partition() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());

    let queues: HashSet<String> = (0..200).map(|i| format!("account-{i}::1")).collect();
    for queue in &queues {
        store
            .queue_insert(queue, "guid", b"payload".to_vec())
            .await
            .expect("Failed to insert");
    }

    let mut found = HashSet::new();
    let mut partition = Partition::from_counter(0);
    for _ in 0..PARTITION_COUNT {
        found.extend(
            store
                .partition_queues(partition, usize::MAX)
                .await
                .expect("Failed to list partition"),
        );
        partition = partition.next();
    }

    assert_eq!(found, queues);
}

#[tokio::test]
async fn test_queue_only_listed_in_its_own_partition() {
    let store = MemoryCacheStore::new();
    let queue = "some-account::7";
    store.queue_insert(queue, "g", Vec::new()).await.unwrap();

    let home = key_slot(queue);
    assert_eq!(store.partition_queues(home, 10).await.unwrap(), [queue]);
    assert!(
        store
            .partition_queues(home.next(), 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_removed_entries_are_gone_for_every_reader() {
    let store = TestCacheStore::new();
    let reader = store.clone();

    store.queue_insert("q", "a", b"1".to_vec()).await.unwrap();
    store.queue_insert("q", "b", b"2".to_vec()).await.unwrap();

    let removed = store.queue_remove("q", &["a".to_string()]).await.unwrap();
    assert_eq!(removed.len(), 1);

    let remaining = reader.queue_range("q", 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].guid, "b");
    assert_eq!(&*remaining[0].payload, b"2");

    // Removing again is a no-op
    assert!(
        store
            .queue_remove("q", &["a".to_string()])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_subscription_survives_publisher_outage() {
    let store = TestCacheStore::new();
    let mut subscription = store.subscribe("events").await.unwrap();

    store.set_unavailable(true);
    assert!(store.publish("events", b"lost".to_vec()).await.is_err());
    store.set_unavailable(false);

    assert_eq!(store.publish("events", b"ok".to_vec()).await.unwrap(), 1);
    let received = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("Timed out waiting for notification")
        .expect("Channel closed");
    assert_eq!(&*received, b"ok");
    assert_eq!(subscription.channel(), "events");
}
