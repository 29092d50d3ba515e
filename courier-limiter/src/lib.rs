//! Leaky-bucket rate limiting
//!
//! Buckets live in the shared cache so every courier instance enforces the
//! same limits. Infrastructure trouble never blocks traffic: when the cache
//! cannot be reached, or holds a bucket that cannot be read, checks fail open
//! and the anomaly is logged.
//!
//! - [`RateLimiter`]: best-effort limiter; rare concurrent updates may be lost
//! - [`LockingRateLimiter`]: serialises checks of one key with a cache lock
//! - [`CardinalityRateLimiter`]: limits distinct targets per key per window
//! - [`DynamicRateLimiter`]: swaps its limiter when configuration changes
//! - [`RateLimiters`]: the named limiters, reconfigurable as a whole

mod bucket;
mod cardinality;
mod config;
mod dynamic;
mod error;
mod limiter;
mod locking;
mod registry;

pub use bucket::LeakyBucket;
pub use cardinality::CardinalityRateLimiter;
pub use config::{CardinalityLimiterConfig, RateLimiterConfig, RateLimitsConfig};
pub use dynamic::{DynamicRateLimiter, build_limiter};
pub use error::{ConfigError, RateLimitExceeded};
pub use limiter::{Limiter, RateLimiter};
pub use locking::{LOCK_TTL, LOCK_WAIT, LockingRateLimiter};
pub use registry::{RateLimiterKind, RateLimiters, UNSEALED_SENDERS};
