#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use courier_cache::{CacheStore, TestCacheStore};
use courier_common::ManualClock;
use courier_limiter::{
    Limiter, RateLimitExceeded, RateLimiter, RateLimiterConfig, RateLimiterKind, RateLimiters,
    RateLimitsConfig,
};

fn setup(config: RateLimiterConfig) -> (RateLimiter, TestCacheStore, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = TestCacheStore::with_clock(Arc::new(clock.clone()));
    let limiter = RateLimiter::new(
        "scenario",
        config,
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
    );
    (limiter, store, clock)
}

#[tokio::test]
async fn test_corrupt_bucket_fails_open_as_fresh_bucket() {
    let (limiter, store, _) = setup(RateLimiterConfig::new(3, 1.0));

    store
        .inner()
        .set("leaky_bucket::scenario::key", b"{ not a bucket".to_vec(), None)
        .await
        .expect("Failed to plant corrupt bucket");

    // A fresh, full bucket: all three units are available
    for _ in 0..3 {
        limiter
            .validate("key", 1)
            .await
            .expect("Corrupt state must not block traffic");
    }
    assert!(limiter.validate("key", 1).await.is_err());
}

#[tokio::test]
async fn test_waiting_retry_after_recovers() {
    let (limiter, _, clock) = setup(RateLimiterConfig::new(4, 3.0));

    for _ in 0..4 {
        limiter.validate("key", 1).await.unwrap();
    }

    let RateLimitExceeded { retry_after } = limiter.validate("key", 2).await.unwrap_err();
    assert_eq!(retry_after, Duration::from_secs(40));

    clock.advance(retry_after - Duration::from_millis(1));
    assert!(limiter.validate("key", 2).await.is_err());

    clock.advance(Duration::from_millis(1));
    assert!(limiter.validate("key", 2).await.is_ok());
}

#[tokio::test]
async fn test_idle_bucket_expires_from_store() {
    let (limiter, store, clock) = setup(RateLimiterConfig::new(2, 60.0));
    limiter.validate("key", 1).await.unwrap();

    clock.advance(Duration::from_secs(2));
    assert_eq!(
        store.inner().get("leaky_bucket::scenario::key").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_outage_then_recovery() {
    let (limiter, store, _) = setup(RateLimiterConfig::new(1, 1.0));

    store.fail_next(2);
    // Load and save both fail; the request is still allowed and nothing stored
    limiter.validate("key", 1).await.unwrap();

    limiter.validate("key", 1).await.unwrap();
    assert!(limiter.validate("key", 1).await.is_err());
}

#[tokio::test]
async fn test_registry_hot_swap_under_load() {
    let clock = ManualClock::new(0);
    let store: Arc<dyn CacheStore> = Arc::new(TestCacheStore::with_clock(Arc::new(clock.clone())));
    let mut config = RateLimitsConfig::default();
    config.lookup = RateLimiterConfig::new(2, 1.0);

    let registry = Arc::new(RateLimiters::new(&config, store, Arc::new(clock)).unwrap());
    let lookup = registry.get(RateLimiterKind::Lookup);

    lookup.validate("user", 2).await.unwrap();
    assert!(!lookup.has_available_permits("user", 1).await);

    config.lookup = RateLimiterConfig::new(10, 1.0).with_report_limits();
    assert_eq!(registry.reconfigure(&config).unwrap(), ["lookup"]);

    assert!(lookup.has_available_permits("user", 8).await);
    assert!(!lookup.has_available_permits("user", 9).await);
}
