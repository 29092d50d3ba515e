use std::time::Duration;

use serde::Deserialize;

use crate::SweeperConfigError;

const fn default_persist_delay() -> u64 {
    10 * 60
}

const fn default_message_batch_limit() -> usize {
    100
}

const fn default_queue_batch_limit() -> usize {
    100
}

const fn default_sweep_interval() -> u64 {
    1_000
}

const fn default_max_batches_per_queue() -> usize {
    10
}

const fn default_cycle_timeout() -> u64 {
    30
}

const fn default_write_timeout() -> u64 {
    10
}

const fn default_max_concurrent_queues() -> usize {
    4
}

/// Sweeper configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SweeperConfig {
    /// How long an envelope stays in the cache before it is made durable
    #[serde(default = "default_persist_delay")]
    pub persist_delay_secs: u64,

    /// Envelopes written to the durable store per batch
    #[serde(default = "default_message_batch_limit")]
    pub message_batch_limit: usize,

    /// Queues examined per cycle
    #[serde(default = "default_queue_batch_limit")]
    pub queue_batch_limit: usize,

    /// Time between cycles; one partition is swept per cycle
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_millis: u64,

    /// Batches migrated from one queue per cycle; the rest waits so other
    /// queues of the partition get their turn
    #[serde(default = "default_max_batches_per_queue")]
    pub max_batches_per_queue: usize,

    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Bound on a single durable batch write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Queues of one partition migrated in parallel
    #[serde(default = "default_max_concurrent_queues")]
    pub max_concurrent_queues: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            persist_delay_secs: default_persist_delay(),
            message_batch_limit: default_message_batch_limit(),
            queue_batch_limit: default_queue_batch_limit(),
            sweep_interval_millis: default_sweep_interval(),
            max_batches_per_queue: default_max_batches_per_queue(),
            cycle_timeout_secs: default_cycle_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_concurrent_queues: default_max_concurrent_queues(),
        }
    }
}

impl SweeperConfig {
    #[must_use]
    pub const fn persist_delay(&self) -> Duration {
        Duration::from_secs(self.persist_delay_secs)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis)
    }

    #[must_use]
    pub const fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// # Errors
    ///
    /// Returns an error if a timer, timeout or batch size is zero. A zero
    /// persist delay is allowed and persists everything on the next visit.
    pub const fn validate(&self) -> Result<(), SweeperConfigError> {
        let zero = if self.sweep_interval_millis == 0 {
            "sweep_interval_millis"
        } else if self.cycle_timeout_secs == 0 {
            "cycle_timeout_secs"
        } else if self.write_timeout_secs == 0 {
            "write_timeout_secs"
        } else if self.message_batch_limit == 0 {
            "message_batch_limit"
        } else if self.queue_batch_limit == 0 {
            "queue_batch_limit"
        } else if self.max_batches_per_queue == 0 {
            "max_batches_per_queue"
        } else {
            return Ok(());
        };

        Err(SweeperConfigError::Zero(zero))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(SweeperConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = SweeperConfig {
            sweep_interval_millis: 0,
            ..SweeperConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SweeperConfigError::Zero("sweep_interval_millis"))
        );
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let config = SweeperConfig {
            cycle_timeout_secs: 0,
            ..SweeperConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SweeperConfigError::Zero("cycle_timeout_secs"))
        );

        let config = SweeperConfig {
            write_timeout_secs: 0,
            ..SweeperConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SweeperConfigError::Zero("write_timeout_secs"))
        );
    }

    #[test]
    fn test_zero_persist_delay_is_allowed() {
        let config = SweeperConfig {
            persist_delay_secs: 0,
            ..SweeperConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
