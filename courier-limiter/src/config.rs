//! Rate limiter configuration

use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, RateLimiterKind};

/// Configuration of one leaky-bucket limiter
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimiterConfig {
    /// Largest burst the bucket admits
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u32,

    /// Units drained from the bucket every minute
    #[serde(default = "default_leak_rate_per_minute")]
    pub leak_rate_per_minute: f64,

    /// Count and log every rejection
    #[serde(default)]
    pub report_limits: bool,

    /// Serialise concurrent checks of the same key with a distributed lock
    #[serde(default)]
    pub locking: bool,
}

const fn default_bucket_size() -> u32 {
    100
}

const fn default_leak_rate_per_minute() -> f64 {
    100.0
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new(default_bucket_size(), default_leak_rate_per_minute())
    }
}

impl RateLimiterConfig {
    #[must_use]
    pub const fn new(bucket_size: u32, leak_rate_per_minute: f64) -> Self {
        Self {
            bucket_size,
            leak_rate_per_minute,
            report_limits: false,
            locking: false,
        }
    }

    #[must_use]
    pub const fn with_locking(mut self) -> Self {
        self.locking = true;
        self
    }

    #[must_use]
    pub const fn with_report_limits(mut self) -> Self {
        self.report_limits = true;
        self
    }

    #[must_use]
    pub fn leak_rate_per_millis(&self) -> f64 {
        self.leak_rate_per_minute / 60_000.0
    }

    /// # Errors
    ///
    /// Returns an error if the bucket is empty or never leaks.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.bucket_size == 0 {
            return Err(ConfigError::invalid(name, "bucket_size must be positive"));
        }

        if !self.leak_rate_per_minute.is_finite() || self.leak_rate_per_minute <= 0.0 {
            return Err(ConfigError::invalid(
                name,
                "leak_rate_per_minute must be a positive number",
            ));
        }

        Ok(())
    }
}

/// Configuration of a limiter on the number of distinct targets per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CardinalityLimiterConfig {
    /// Distinct targets admitted per key within one window
    #[serde(default = "default_max_cardinality")]
    pub max_cardinality: usize,

    /// Window length; it starts with the first target seen for a key
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub report_limits: bool,
}

const fn default_max_cardinality() -> usize {
    100
}

const fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for CardinalityLimiterConfig {
    fn default() -> Self {
        Self {
            max_cardinality: default_max_cardinality(),
            ttl_secs: default_ttl_secs(),
            report_limits: false,
        }
    }
}

impl CardinalityLimiterConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// # Errors
    ///
    /// Returns an error if the window is empty.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid(name, "ttl_secs must be positive"));
        }

        Ok(())
    }
}

/// Configuration of every named limiter
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_verify_code")]
    pub verify_code: RateLimiterConfig,

    #[serde(default = "default_lookup")]
    pub lookup: RateLimiterConfig,

    #[serde(default = "default_allocate")]
    pub allocate: RateLimiterConfig,

    #[serde(default = "default_message")]
    pub message: RateLimiterConfig,

    #[serde(default)]
    pub unsealed_senders: CardinalityLimiterConfig,
}

const fn default_verify_code() -> RateLimiterConfig {
    // Six attempts, one more every ten minutes
    RateLimiterConfig::new(6, 0.1).with_locking()
}

const fn default_lookup() -> RateLimiterConfig {
    RateLimiterConfig::new(100, 100.0)
}

const fn default_allocate() -> RateLimiterConfig {
    RateLimiterConfig::new(5, 1.0)
}

const fn default_message() -> RateLimiterConfig {
    RateLimiterConfig::new(60, 60.0)
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            verify_code: default_verify_code(),
            lookup: default_lookup(),
            allocate: default_allocate(),
            message: default_message(),
            unsealed_senders: CardinalityLimiterConfig::default(),
        }
    }
}

impl RateLimitsConfig {
    #[must_use]
    pub const fn get(&self, kind: RateLimiterKind) -> &RateLimiterConfig {
        match kind {
            RateLimiterKind::VerifyCode => &self.verify_code,
            RateLimiterKind::Lookup => &self.lookup,
            RateLimiterKind::Allocate => &self.allocate,
            RateLimiterKind::Message => &self.message,
        }
    }

    /// # Errors
    ///
    /// Returns the first invalid limiter configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in RateLimiterKind::ALL {
            self.get(kind).validate(kind.name())?;
        }

        self.unsealed_senders
            .validate(crate::registry::UNSEALED_SENDERS)
    }
}
