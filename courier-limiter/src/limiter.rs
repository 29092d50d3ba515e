use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_cache::CacheStore;
use courier_common::SharedClock;

use crate::{LeakyBucket, RateLimitExceeded, RateLimiterConfig};

/// Upper bound on a single store round trip made while checking a limit.
/// Slower stores are treated as unavailable and the check fails open.
pub(crate) const STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// A rate limiter keyed by an arbitrary string
#[async_trait]
pub trait Limiter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn config(&self) -> RateLimiterConfig;

    /// Consume `amount` units for `key`
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] with the time until `amount` units fit.
    async fn validate(&self, key: &str, amount: u32) -> Result<(), RateLimitExceeded>;

    /// Whether `amount` units would currently fit, without consuming them
    async fn has_available_permits(&self, key: &str, amount: u32) -> bool;

    /// Reset `key` to a full, unused bucket
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be reached.
    async fn clear(&self, key: &str) -> courier_cache::Result<()>;
}

/// Run a store call under [`STORE_TIMEOUT`]
pub(crate) async fn bounded<T>(
    call: impl Future<Output = courier_cache::Result<T>> + Send,
) -> courier_cache::Result<T> {
    tokio::time::timeout(STORE_TIMEOUT, call)
        .await
        .map_err(|_| courier_cache::CacheError::Timeout(STORE_TIMEOUT))?
}

pub(crate) fn record_fail_open(name: &str, reason: &'static str) {
    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics.ratelimit.record_fail_open(name, reason);
    }
}

/// Leaky-bucket limiter whose buckets live in the shared cache
///
/// Concurrent checks of the same key may occasionally lose an update; wrap
/// it in a [`crate::LockingRateLimiter`] where that matters.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    store: Arc<dyn CacheStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
        store: Arc<dyn CacheStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            clock,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("leaky_bucket::{}::{key}", self.name)
    }

    /// Load the bucket for `key`, leaked up to `now`. Anything unusable in
    /// the store yields a fresh bucket.
    async fn load(&self, bucket_key: &str, now: u64) -> LeakyBucket {
        let mut bucket = match bounded(self.store.get(bucket_key)).await {
            Ok(Some(bytes)) => match LeakyBucket::from_slice(&bytes) {
                Ok(bucket) => bucket.reconfigured(&self.config),
                Err(err) => {
                    tracing::warn!(
                        limiter = %self.name,
                        key = %bucket_key,
                        error = %err,
                        "Discarding unreadable rate limit bucket"
                    );
                    record_fail_open(&self.name, "corrupt");
                    LeakyBucket::new(&self.config, now)
                }
            },
            Ok(None) => LeakyBucket::new(&self.config, now),
            Err(err) => {
                tracing::warn!(
                    limiter = %self.name,
                    key = %bucket_key,
                    error = %err,
                    "Rate limit store unavailable, allowing request"
                );
                record_fail_open(&self.name, "unavailable");
                LeakyBucket::new(&self.config, now)
            }
        };

        bucket.leak(now);
        bucket
    }

    async fn save(&self, bucket_key: &str, bucket: &LeakyBucket) {
        let bytes = match bucket.to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(limiter = %self.name, error = %err, "Failed to encode rate limit bucket");
                return;
            }
        };

        if let Err(err) = bounded(self.store.set(bucket_key, bytes, Some(bucket.ttl()))).await {
            tracing::warn!(
                limiter = %self.name,
                key = %bucket_key,
                error = %err,
                "Failed to store rate limit bucket"
            );
            record_fail_open(&self.name, "unavailable");
        }
    }

    fn report(&self, key: &str, allowed: bool, retry_after: Duration) {
        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.ratelimit.record_check(&self.name, allowed);
            if !allowed && self.config.report_limits {
                metrics.ratelimit.record_exceeded(&self.name);
            }
        }

        if !allowed && self.config.report_limits {
            tracing::debug!(
                limiter = %self.name,
                key,
                retry_after_ms = retry_after.as_millis(),
                "Rate limit exceeded"
            );
        }
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> RateLimiterConfig {
        self.config
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn validate(&self, key: &str, amount: u32) -> Result<(), RateLimitExceeded> {
        let bucket_key = self.bucket_key(key);
        let now = self.clock.now_millis();
        let mut bucket = self.load(&bucket_key, now).await;

        match bucket.add(amount, now) {
            Ok(()) => {
                self.save(&bucket_key, &bucket).await;
                self.report(key, true, Duration::ZERO);
                Ok(())
            }
            Err(retry_after) => {
                self.report(key, false, retry_after);
                Err(RateLimitExceeded::new(retry_after))
            }
        }
    }

    async fn has_available_permits(&self, key: &str, amount: u32) -> bool {
        let now = self.clock.now_millis();
        amount <= self.config.bucket_size
            && self
                .load(&self.bucket_key(key), now)
                .await
                .has_space(amount)
    }

    async fn clear(&self, key: &str) -> courier_cache::Result<()> {
        bounded(self.store.delete(&self.bucket_key(key))).await?;
        Ok(())
    }
}
