//! Migration of a single queue
//!
//! A queue is migrated batch by batch: read the oldest envelopes, write the
//! aged ones to the durable store, and only then remove exactly those from
//! the cache. A failed or timed out write ends the queue's migration for this
//! cycle with nothing removed, so the batch is retried on a later visit.

use courier_cache::Partition;

use super::Sweeper;
use crate::{
    MailboxError, QueueKey, Result,
    queue::{Peeked, record_removed},
};

/// What happened to one queue during a cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    /// Envelopes written to the durable store and removed from the cache
    pub persisted: usize,
    /// Ephemeral or unreadable envelopes dropped without being persisted
    pub discarded: usize,
    /// Durable batch writes made
    pub batches: usize,
    /// The oldest envelope had not reached the persist delay yet
    pub too_young: bool,
    /// Another sweeper is migrating the queue
    pub locked: bool,
}

/// Summary of one sweep cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub partition: Partition,
    pub queues_examined: usize,
    /// Queues from which at least one envelope was migrated or discarded
    pub queues_persisted: usize,
    pub messages_persisted: usize,
    pub messages_discarded: usize,
    pub batches: usize,
    /// Queues whose migration stopped early on an error
    pub failures: usize,
}

impl CycleReport {
    #[must_use]
    pub const fn new(partition: Partition) -> Self {
        Self {
            partition,
            queues_examined: 0,
            queues_persisted: 0,
            messages_persisted: 0,
            messages_discarded: 0,
            batches: 0,
            failures: 0,
        }
    }

    pub(crate) const fn record(&mut self, queue: &QueueReport) {
        self.queues_examined += 1;
        if queue.persisted > 0 || queue.discarded > 0 {
            self.queues_persisted += 1;
        }
        self.messages_persisted += queue.persisted;
        self.messages_discarded += queue.discarded;
        self.batches += queue.batches;
    }

    pub(crate) const fn record_failure(&mut self) {
        self.queues_examined += 1;
        self.failures += 1;
    }
}

fn as_u64(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

impl Sweeper {
    /// Migrate `key` if its oldest envelope has waited past the persist delay
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or the durable store failed. Everything
    /// confirmed durable before the failure has already been removed.
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %key))]
    pub async fn persist_queue(&self, key: QueueKey) -> Result<QueueReport> {
        let mut report = QueueReport::default();
        let now = self.clock.now_millis();

        let Some((oldest, _)) = self.cache.peek_entries(&key, 1).await?.into_iter().next() else {
            return Ok(report);
        };

        if now.saturating_sub(oldest) < self.persist_delay_millis() {
            report.too_young = true;
            return Ok(report);
        }

        let Some(lock) = self
            .cache
            .lock_for_persistence(&key, self.config.cycle_timeout())
            .await?
        else {
            tracing::debug!(queue = %key, "Queue is already being persisted elsewhere");
            report.locked = true;
            return Ok(report);
        };

        let result = self.migrate(&key, now, &mut report).await;

        match self.cache.unlock_for_persistence(lock).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(queue = %key, "Persistence lock lapsed before the migration finished");
            }
            Err(err) => {
                tracing::warn!(queue = %key, error = %err, "Failed to release persistence lock");
            }
        }

        if report.persisted > 0 {
            tracing::info!(
                queue = %key,
                persisted = report.persisted,
                batches = report.batches,
                "Persisted queued envelopes"
            );

            if let Err(err) = self.cache.notify_persisted(&key).await {
                tracing::warn!(queue = %key, error = %err, "Failed to notify reader of persisted envelopes");
            }
        }

        record_removed("persisted", report.persisted + report.discarded);
        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics
                .sweeper
                .record_queue_swept(as_u64(report.persisted), as_u64(report.discarded));
            if let Err(err) = &result {
                metrics.sweeper.record_persist_failure(match err {
                    MailboxError::Timeout(_) => "timeout",
                    _ => "error",
                });
            }
        }

        result.map(|()| report)
    }

    async fn migrate(&self, key: &QueueKey, now: u64, report: &mut QueueReport) -> Result<()> {
        let batch_limit = self.config.message_batch_limit.max(1);
        let delay = self.persist_delay_millis();

        for _ in 0..self.config.max_batches_per_queue.max(1) {
            let entries = self.cache.peek_entries(key, batch_limit).await?;
            let fetched = entries.len();

            let mut reached_young = false;
            let mut guids = Vec::with_capacity(fetched);
            let mut batch = Vec::with_capacity(fetched);
            let mut discarded = 0;

            for (server_timestamp, peeked) in entries {
                if now.saturating_sub(server_timestamp) < delay {
                    reached_young = true;
                    break;
                }

                match peeked {
                    Peeked::Envelope(envelope) => {
                        guids.push(envelope.server_guid.to_string());
                        if envelope.ephemeral {
                            discarded += 1;
                        } else {
                            batch.push(envelope);
                        }
                    }
                    Peeked::Corrupt(guid) => {
                        guids.push(guid);
                        discarded += 1;
                    }
                }
            }

            if guids.is_empty() {
                break;
            }

            if !batch.is_empty() {
                let timeout = self.config.write_timeout();
                tokio::time::timeout(timeout, self.durable.store_batch(key, &batch))
                    .await
                    .map_err(|_| MailboxError::Timeout(timeout))??;
                report.batches += 1;
            }

            self.cache.remove_raw(key, &guids).await?;
            report.persisted += batch.len();
            report.discarded += discarded;

            if reached_young || fetched < batch_limit {
                break;
            }
        }

        Ok(())
    }
}
