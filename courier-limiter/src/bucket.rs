//! The leaky bucket
//!
//! A bucket admits bursts of up to `bucket_size` units and drains at a
//! constant rate. The fill level is recomputed lazily on every access from the
//! time elapsed since the last update, so nothing has to run in the background.
//!
//! ```text
//! bucket_size: 10, leak: 60/min (1 per second)
//! - 10 units are admitted immediately
//! - the 11th is rejected with retry_after = 1s
//! - after 1s exactly one more unit fits
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RateLimiterConfig;

/// Slack for floating point drift when comparing fill levels, so that
/// waiting the advertised retry interval always admits the request.
const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakyBucket {
    bucket_size: u32,
    leak_rate_per_millis: f64,
    space_used: f64,
    last_update_time_millis: u64,
}

impl LeakyBucket {
    /// A fresh bucket with its whole capacity available
    #[must_use]
    pub fn new(config: &RateLimiterConfig, now_millis: u64) -> Self {
        Self {
            bucket_size: config.bucket_size,
            leak_rate_per_millis: config.leak_rate_per_millis(),
            space_used: 0.0,
            last_update_time_millis: now_millis,
        }
    }

    /// Decode a stored bucket
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a serialized bucket.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        let bucket: Self = serde_json::from_slice(bytes)?;
        if !bucket.space_used.is_finite() || bucket.space_used < 0.0 {
            return Err(serde::de::Error::custom("space used out of range"));
        }
        Ok(bucket)
    }

    /// # Errors
    ///
    /// Serialization of this plain struct does not fail in practice.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Apply a (possibly changed) configuration to a stored bucket. Usage is
    /// kept, clamped to the new capacity.
    #[must_use]
    pub fn reconfigured(mut self, config: &RateLimiterConfig) -> Self {
        self.bucket_size = config.bucket_size;
        self.leak_rate_per_millis = config.leak_rate_per_millis();
        self.space_used = self.space_used.min(self.capacity());
        self
    }

    fn capacity(&self) -> f64 {
        f64::from(self.bucket_size)
    }

    /// Drain whatever leaked out since the last update
    pub fn leak(&mut self, now_millis: u64) {
        // Clocks going backwards leak nothing
        let elapsed = now_millis.saturating_sub(self.last_update_time_millis);
        #[allow(clippy::cast_precision_loss, reason = "Elapsed millis stay well below 2^52")]
        let leaked = elapsed as f64 * self.leak_rate_per_millis;

        self.space_used = (self.space_used - leaked).max(0.0);
        self.last_update_time_millis = self.last_update_time_millis.max(now_millis);
    }

    #[must_use]
    pub fn space_remaining(&self) -> f64 {
        self.capacity() - self.space_used
    }

    #[must_use]
    pub fn has_space(&self, amount: u32) -> bool {
        self.space_remaining() + EPSILON >= f64::from(amount)
    }

    /// Leak, then consume `amount` units if they fit
    ///
    /// # Errors
    ///
    /// Returns how long to wait until `amount` units fit.
    pub fn add(&mut self, amount: u32, now_millis: u64) -> Result<(), Duration> {
        self.leak(now_millis);

        if amount > self.bucket_size {
            // Never fits; report the time for a full drain
            return Err(self.millis_to_drain(self.capacity()));
        }

        if self.has_space(amount) {
            self.space_used = (self.space_used + f64::from(amount)).min(self.capacity());
            Ok(())
        } else {
            Err(self.time_until_space_available(amount))
        }
    }

    /// Time until `amount` units fit, assuming nothing else is added
    #[must_use]
    pub fn time_until_space_available(&self, amount: u32) -> Duration {
        let needed = f64::from(amount) - self.space_remaining();
        if needed <= 0.0 {
            return Duration::ZERO;
        }

        self.millis_to_drain(needed)
    }

    fn millis_to_drain(&self, units: f64) -> Duration {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "The quotient is positive and rounded up"
        )]
        let millis = (units / self.leak_rate_per_millis - EPSILON).ceil() as u64;
        Duration::from_millis(millis)
    }

    /// How long the stored bucket must live: the time a full bucket takes to
    /// drain, rounded up to whole seconds
    #[must_use]
    pub fn ttl(&self) -> Duration {
        let drain = self.millis_to_drain(self.capacity()).as_millis();
        let secs = drain.div_ceil(1000).max(1);
        Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
    }
}
