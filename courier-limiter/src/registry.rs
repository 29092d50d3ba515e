//! The named limiters guarding courier's entry points

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use courier_cache::CacheStore;
use courier_common::SharedClock;
use parking_lot::RwLock;

use crate::{
    CardinalityRateLimiter, ConfigError, DynamicRateLimiter, Limiter, RateLimitsConfig,
};

/// Name of the distinct-sender limiter
pub const UNSEALED_SENDERS: &str = "unsealed_senders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimiterKind {
    /// Verification code attempts; checks of one key are serialised
    VerifyCode,
    Lookup,
    Allocate,
    Message,
}

impl RateLimiterKind {
    pub const ALL: [Self; 4] = [Self::VerifyCode, Self::Lookup, Self::Allocate, Self::Message];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::VerifyCode => "verify_code",
            Self::Lookup => "lookup",
            Self::Allocate => "allocate",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for RateLimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every named limiter, built from one [`RateLimitsConfig`]
#[derive(Debug)]
pub struct RateLimiters {
    limiters: AHashMap<RateLimiterKind, DynamicRateLimiter>,
    unsealed_senders: RwLock<Arc<CardinalityRateLimiter>>,
    store: Arc<dyn CacheStore>,
}

impl RateLimiters {
    /// # Errors
    ///
    /// Returns the first invalid limiter configuration.
    pub fn new(
        config: &RateLimitsConfig,
        store: Arc<dyn CacheStore>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let limiters = RateLimiterKind::ALL
            .into_iter()
            .map(|kind| {
                DynamicRateLimiter::new(kind.name(), *config.get(kind), store.clone(), clock.clone())
                    .map(|limiter| (kind, limiter))
            })
            .collect::<Result<_, _>>()?;

        let unsealed_senders = Arc::new(CardinalityRateLimiter::new(
            UNSEALED_SENDERS,
            config.unsealed_senders,
            store.clone(),
        ));

        Ok(Self {
            limiters,
            unsealed_senders: RwLock::new(unsealed_senders),
            store,
        })
    }

    /// The limiter for `kind`
    pub fn get(&self, kind: RateLimiterKind) -> &DynamicRateLimiter {
        &self.limiters[&kind]
    }

    pub fn unsealed_senders(&self) -> Arc<CardinalityRateLimiter> {
        self.unsealed_senders.read().clone()
    }

    /// Apply a new configuration, swapping only the limiters whose
    /// configuration changed. Nothing is swapped unless every entry is valid.
    /// Returns the names of the limiters that were swapped.
    ///
    /// # Errors
    ///
    /// Returns the first invalid limiter configuration.
    pub fn reconfigure(&self, config: &RateLimitsConfig) -> Result<Vec<&'static str>, ConfigError> {
        config.validate()?;

        let mut swapped = Vec::new();
        for kind in RateLimiterKind::ALL {
            if self.get(kind).update(*config.get(kind))? {
                swapped.push(kind.name());
            }
        }

        let mut unsealed_senders = self.unsealed_senders.write();
        if *unsealed_senders.config() != config.unsealed_senders {
            *unsealed_senders = Arc::new(CardinalityRateLimiter::new(
                UNSEALED_SENDERS,
                config.unsealed_senders,
                self.store.clone(),
            ));
            swapped.push(UNSEALED_SENDERS);
        }
        drop(unsealed_senders);

        Ok(swapped)
    }

    /// Current configuration of every limiter
    pub fn config(&self) -> RateLimitsConfig {
        RateLimitsConfig {
            verify_code: self.get(RateLimiterKind::VerifyCode).config(),
            lookup: self.get(RateLimiterKind::Lookup).config(),
            allocate: self.get(RateLimiterKind::Allocate).config(),
            message: self.get(RateLimiterKind::Message).config(),
            unsealed_senders: *self.unsealed_senders.read().config(),
        }
    }
}
