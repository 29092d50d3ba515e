//! A limiter that serialises concurrent checks of the same key
//!
//! The plain [`RateLimiter`] reads, updates and writes a bucket in separate
//! store calls, so two concurrent checks can both see the same fill level.
//! Wrapping it here takes a short-lived lock in the shared cache around that
//! read-modify-write. Callers that cannot get the lock within
//! [`LOCK_WAIT`] are rejected with a zero retry interval.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_cache::CacheStore;
use courier_common::SharedClock;

use crate::{
    Limiter, RateLimitExceeded, RateLimiter, RateLimiterConfig,
    limiter::{bounded, record_fail_open},
};

/// How long a lock outlives a holder that never released it
pub const LOCK_TTL: Duration = Duration::from_secs(10);

/// How long a caller waits for another holder before giving up
pub const LOCK_WAIT: Duration = Duration::from_secs(1);

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LockingRateLimiter {
    inner: RateLimiter,
}

enum Lock {
    Held(String),
    /// The store could not be asked; the check proceeds unlocked
    Unavailable,
    Contended,
}

impl LockingRateLimiter {
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
        store: Arc<dyn CacheStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: RateLimiter::new(name, config, store, clock),
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("leaky_bucket_lock::{}::{key}", self.inner.name())
    }

    async fn acquire(&self, lock_key: &str) -> Lock {
        let token = ulid::Ulid::new().to_string();
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match bounded(
                self.inner
                    .store()
                    .set_nx(lock_key, token.clone().into_bytes(), LOCK_TTL),
            )
            .await
            {
                Ok(true) => return Lock::Held(token),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        limiter = %self.inner.name(),
                        key = %lock_key,
                        error = %err,
                        "Unable to take rate limit lock, continuing without it"
                    );
                    record_fail_open(self.inner.name(), "unavailable");
                    return Lock::Unavailable;
                }
            }

            if tokio::time::Instant::now() + backoff > deadline {
                return Lock::Contended;
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn release(&self, lock_key: &str, token: &str) {
        match bounded(
            self.inner
                .store()
                .delete_if_equals(lock_key, token.as_bytes()),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                limiter = %self.inner.name(),
                key = %lock_key,
                "Rate limit lock expired before it was released"
            ),
            Err(err) => tracing::warn!(
                limiter = %self.inner.name(),
                key = %lock_key,
                error = %err,
                "Failed to release rate limit lock"
            ),
        }
    }
}

#[async_trait]
impl Limiter for LockingRateLimiter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn config(&self) -> RateLimiterConfig {
        self.inner.config()
    }

    async fn validate(&self, key: &str, amount: u32) -> Result<(), RateLimitExceeded> {
        let lock_key = self.lock_key(key);

        match self.acquire(&lock_key).await {
            Lock::Held(token) => {
                let result = self.inner.validate(key, amount).await;
                self.release(&lock_key, &token).await;
                result
            }
            Lock::Unavailable => self.inner.validate(key, amount).await,
            Lock::Contended => {
                tracing::debug!(limiter = %self.inner.name(), key, "Rate limit lock contended");
                Err(RateLimitExceeded::new(Duration::ZERO))
            }
        }
    }

    async fn has_available_permits(&self, key: &str, amount: u32) -> bool {
        self.inner.has_available_permits(key, amount).await
    }

    async fn clear(&self, key: &str) -> courier_cache::Result<()> {
        self.inner.clear(key).await
    }
}
