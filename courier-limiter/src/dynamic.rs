//! Rate limiters whose configuration can change at runtime
//!
//! The active limiter is an immutable value behind a shared pointer. A
//! reconfiguration builds a new limiter and swaps the pointer; checks already
//! running keep the limiter they started with, so no check ever sees half of
//! an old configuration and half of a new one.

use std::sync::Arc;

use async_trait::async_trait;
use courier_cache::CacheStore;
use courier_common::SharedClock;
use parking_lot::RwLock;

use crate::{
    ConfigError, Limiter, LockingRateLimiter, RateLimitExceeded, RateLimiter, RateLimiterConfig,
};

/// Build the limiter a configuration asks for
///
/// # Errors
///
/// Returns an error if `config` is invalid.
pub fn build_limiter(
    name: &str,
    config: RateLimiterConfig,
    store: Arc<dyn CacheStore>,
    clock: SharedClock,
) -> Result<Arc<dyn Limiter>, ConfigError> {
    config.validate(name)?;

    Ok(if config.locking {
        Arc::new(LockingRateLimiter::new(name, config, store, clock))
    } else {
        Arc::new(RateLimiter::new(name, config, store, clock))
    })
}

#[derive(Debug)]
pub struct DynamicRateLimiter {
    name: String,
    store: Arc<dyn CacheStore>,
    clock: SharedClock,
    current: RwLock<Arc<dyn Limiter>>,
}

impl DynamicRateLimiter {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
        store: Arc<dyn CacheStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let current = build_limiter(&name, config, store.clone(), clock.clone())?;

        Ok(Self {
            name,
            store,
            clock,
            current: RwLock::new(current),
        })
    }

    /// The limiter currently in effect
    pub fn current(&self) -> Arc<dyn Limiter> {
        self.current.read().clone()
    }

    /// Swap in a limiter built from `config` if it differs from the current
    /// one. Returns whether a swap happened. Stored buckets are kept and pick
    /// up the new capacity and leak rate on their next check.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid; the current limiter stays.
    pub fn update(&self, config: RateLimiterConfig) -> Result<bool, ConfigError> {
        if self.config() == config {
            return Ok(false);
        }

        let replacement = build_limiter(&self.name, config, self.store.clone(), self.clock.clone())?;

        let mut current = self.current.write();
        if current.config() == config {
            return Ok(false);
        }
        *current = replacement;
        drop(current);

        tracing::info!(
            limiter = %self.name,
            bucket_size = config.bucket_size,
            leak_rate_per_minute = config.leak_rate_per_minute,
            locking = config.locking,
            "Rate limiter reconfigured"
        );

        Ok(true)
    }
}

#[async_trait]
impl Limiter for DynamicRateLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> RateLimiterConfig {
        self.current.read().config()
    }

    async fn validate(&self, key: &str, amount: u32) -> Result<(), RateLimitExceeded> {
        let limiter = self.current();
        limiter.validate(key, amount).await
    }

    async fn has_available_permits(&self, key: &str, amount: u32) -> bool {
        let limiter = self.current();
        limiter.has_available_permits(key, amount).await
    }

    async fn clear(&self, key: &str) -> courier_cache::Result<()> {
        let limiter = self.current();
        limiter.clear(key).await
    }
}
