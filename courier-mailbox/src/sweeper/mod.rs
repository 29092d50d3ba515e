//! Persistence sweeper
//!
//! Envelopes that wait in the cache longer than the persist delay are moved
//! to the durable store. Each cycle claims one partition from the shared
//! [`ShardCursor`] and migrates the longest-waiting queues in it, so over
//! [`courier_cache::PARTITION_COUNT`] cycles every queue is visited once.
//!
//! A cycle is bounded by its timeout. The cursor is advanced before any work
//! starts, so a partition that keeps timing out cannot stall the rotation.

mod config;
mod cursor;
mod cycle;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_cache::Partition;
use courier_common::{SharedClock, Signal, internal};
use tokio::{sync::broadcast, task::JoinSet, time::MissedTickBehavior};

pub use config::SweeperConfig;
pub use cursor::{DEFAULT_CURSOR_KEY, ShardCursor};
pub use cycle::{CycleReport, QueueReport};

use crate::{DurableStore, MailboxError, MessagesCache, QueueKey, Result};

#[derive(Debug, Clone)]
pub struct Sweeper {
    cache: Arc<MessagesCache>,
    durable: Arc<dyn DurableStore>,
    cursor: ShardCursor,
    config: SweeperConfig,
    clock: SharedClock,
}

impl Sweeper {
    pub fn new(
        cache: Arc<MessagesCache>,
        durable: Arc<dyn DurableStore>,
        cursor: ShardCursor,
        config: SweeperConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            cache,
            durable,
            cursor,
            config,
            clock,
        }
    }

    pub const fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub const fn cursor(&self) -> &ShardCursor {
        &self.cursor
    }

    fn persist_delay_millis(&self) -> u64 {
        u64::try_from(self.config.persist_delay().as_millis()).unwrap_or(u64::MAX)
    }

    /// Run cycles until a shutdown signal is received
    ///
    /// A failing cycle is logged and the next one runs on schedule. A cycle
    /// in progress when the signal arrives is abandoned; envelopes it had not
    /// removed yet stay in the cache and are picked up after a restart.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, "Persistence sweeper starting");

        // A zero period makes tokio panic
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.messages_persisted > 0 || report.messages_discarded > 0 => {
                            tracing::info!(
                                partition = report.partition.index(),
                                queues = report.queues_persisted,
                                persisted = report.messages_persisted,
                                discarded = report.messages_discarded,
                                "Sweep cycle migrated envelopes"
                            );
                        }
                        Ok(report) => {
                            tracing::trace!(
                                partition = report.partition.index(),
                                queues = report.queues_examined,
                                "Sweep cycle found nothing to migrate"
                            );
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "Sweep cycle failed");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Persistence sweeper received shutdown signal");
                            break;
                        }
                        Err(err) => {
                            tracing::error!("Persistence sweeper shutdown channel error: {err}");
                            break;
                        }
                    }
                }
            }
        }

        internal!(level = INFO, "Persistence sweeper shutdown complete");
    }

    /// Claim the next partition and sweep it within the cycle timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor could not be advanced, the partition
    /// could not be listed, or the cycle ran past its timeout. The cursor has
    /// moved on in the last two cases.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let partition = match self.cursor.advance().await {
            Ok(partition) => partition,
            Err(err) => {
                record_cycle("failed", started);
                return Err(err);
            }
        };

        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.sweeper.set_cursor(partition.index());
        }

        let timeout = self.config.cycle_timeout();
        match tokio::time::timeout(timeout, self.sweep_partition(partition)).await {
            Ok(Ok(report)) => {
                record_cycle("completed", started);
                Ok(report)
            }
            Ok(Err(err)) => {
                record_cycle("failed", started);
                Err(err)
            }
            Err(_) => {
                tracing::warn!(
                    partition = partition.index(),
                    timeout_secs = timeout.as_secs(),
                    "Sweep cycle timed out"
                );
                record_cycle("timed_out", started);
                Err(MailboxError::Timeout(timeout))
            }
        }
    }

    /// Migrate the longest-waiting queues of `partition`
    ///
    /// Up to `max_concurrent_queues` queues are migrated at once. A queue
    /// that fails is counted and skipped; it does not end the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition's queues could not be listed.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = partition.index()))]
    pub async fn sweep_partition(&self, partition: Partition) -> Result<CycleReport> {
        let names = self
            .cache
            .queue_names_in_partition(partition, self.config.queue_batch_limit)
            .await?;

        let mut report = CycleReport::new(partition);
        let mut pending = names
            .into_iter()
            .filter_map(|name| match QueueKey::from_queue_name(&name) {
                Ok(key) => Some(key),
                Err(err) => {
                    tracing::warn!(queue = %name, error = %err, "Skipping unrecognised queue");
                    None
                }
            });

        let mut join_set: JoinSet<(QueueKey, Result<QueueReport>)> = JoinSet::new();

        for key in pending.by_ref().take(self.config.max_concurrent_queues.max(1)) {
            self.spawn_queue(&mut join_set, key);
        }

        // As queues complete, start the next ones
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(queue))) => report.record(&queue),
                Ok((key, Err(err))) => {
                    tracing::warn!(queue = %key, error = %err, "Failed to persist queue");
                    report.record_failure();
                }
                Err(err) => {
                    tracing::error!(error = %err, "Queue persistence task failed");
                    report.record_failure();
                }
            }

            if let Some(key) = pending.next() {
                self.spawn_queue(&mut join_set, key);
            }
        }

        Ok(report)
    }

    fn spawn_queue(&self, join_set: &mut JoinSet<(QueueKey, Result<QueueReport>)>, key: QueueKey) {
        let sweeper = self.clone();
        join_set.spawn(async move { (key, sweeper.persist_queue(key).await) });
    }
}

fn record_cycle(outcome: &'static str, started: Instant) {
    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics
            .sweeper
            .record_cycle(outcome, started.elapsed().as_secs_f64());
    }
}
