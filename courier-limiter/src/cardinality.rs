use std::{sync::Arc, time::Duration};

use courier_cache::{CacheStore, SetAddOutcome};

use crate::{
    CardinalityLimiterConfig, RateLimitExceeded,
    limiter::{bounded, record_fail_open},
};

/// Limits how many distinct targets one key may touch within a window
///
/// The window opens with the first target recorded for a key and lasts
/// `ttl_secs`; repeating a target already seen in the window is free.
#[derive(Debug, Clone)]
pub struct CardinalityRateLimiter {
    name: String,
    config: CardinalityLimiterConfig,
    store: Arc<dyn CacheStore>,
}

impl CardinalityRateLimiter {
    pub fn new(
        name: impl Into<String>,
        config: CardinalityLimiterConfig,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &CardinalityLimiterConfig {
        &self.config
    }

    fn set_key(&self, key: &str) -> String {
        format!("cardinality::{}::{key}", self.name)
    }

    /// Record that `key` touched `target`
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] carrying the time left in the window when
    /// `target` is new and the window already holds `max_cardinality` targets.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn validate(&self, key: &str, target: &str) -> Result<(), RateLimitExceeded> {
        let outcome = bounded(self.store.set_add_bounded(
            &self.set_key(key),
            target,
            self.config.max_cardinality,
            self.config.ttl(),
        ))
        .await;

        match outcome {
            Ok(SetAddOutcome::Present { .. } | SetAddOutcome::Added { .. }) => {
                self.report(key, true, Duration::ZERO);
                Ok(())
            }
            Ok(SetAddOutcome::Rejected { expires_in, .. }) => {
                self.report(key, false, expires_in);
                Err(RateLimitExceeded::new(expires_in))
            }
            Err(err) => {
                tracing::warn!(
                    limiter = %self.name,
                    key,
                    error = %err,
                    "Cardinality store unavailable, allowing request"
                );
                record_fail_open(&self.name, "unavailable");
                Ok(())
            }
        }
    }

    /// Forget every target recorded for `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be reached.
    pub async fn clear(&self, key: &str) -> courier_cache::Result<()> {
        bounded(self.store.delete(&self.set_key(key))).await?;
        Ok(())
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
                retry_after_secs = retry_after.as_secs(),
                "Cardinality limit exceeded"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_cache::TestCacheStore;
    use courier_common::ManualClock;

    use super::*;

    fn limiter(max_cardinality: usize) -> (CardinalityRateLimiter, TestCacheStore, ManualClock) {
        let clock = ManualClock::new(0);
        let store = TestCacheStore::with_clock(Arc::new(clock.clone()));
        let limiter = CardinalityRateLimiter::new(
            "unsealed_senders",
            CardinalityLimiterConfig {
                max_cardinality,
                ttl_secs: 60,
                report_limits: true,
            },
            Arc::new(store.clone()),
        );
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_limits_distinct_targets() {
        let (limiter, _, clock) = limiter(2);

        limiter.validate("sender", "a").await.unwrap();
        limiter.validate("sender", "b").await.unwrap();
        // Repeats are free
        limiter.validate("sender", "a").await.unwrap();

        clock.advance(Duration::from_secs(15));
        assert_eq!(
            limiter.validate("sender", "c").await,
            Err(RateLimitExceeded::new(Duration::from_secs(45)))
        );

        // Other keys have their own window
        limiter.validate("other", "c").await.unwrap();
    }

    #[tokio::test]
    async fn test_window_expires() {
        let (limiter, _, clock) = limiter(1);

        limiter.validate("sender", "a").await.unwrap();
        assert!(limiter.validate("sender", "b").await.is_err());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.validate("sender", "b").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_and_fail_open() {
        let (limiter, store, _) = limiter(1);

        limiter.validate("sender", "a").await.unwrap();
        limiter.clear("sender").await.unwrap();
        limiter.validate("sender", "b").await.unwrap();

        store.set_unavailable(true);
        assert!(limiter.validate("sender", "c").await.is_ok());
    }
}
