//! Persistence sweeper metrics
//!
//! Tracks how much transient state is migrated to durable storage per cycle,
//! how long cycles take and where the shard cursor currently points.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

#[derive(Debug)]
pub struct SweeperMetrics {
    /// Cycles run, by outcome
    cycles_total: Counter<u64>,

    cycle_duration_seconds: Histogram<f64>,

    queues_swept: Counter<u64>,

    messages_persisted: Counter<u64>,

    /// Ephemeral envelopes dropped instead of being persisted
    messages_discarded: Counter<u64>,

    /// Durable writes that failed or timed out
    persist_failures: Counter<u64>,

    // Shared with the observable gauge callback
    cursor: Arc<AtomicU64>,
}

impl SweeperMetrics {
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let cycles_total = meter
            .u64_counter("courier.sweeper.cycles.total")
            .with_description("Sweeper cycles by outcome")
            .build();

        let cycle_duration_seconds = meter
            .f64_histogram("courier.sweeper.cycle.duration.seconds")
            .with_description("Distribution of sweeper cycle durations")
            .build();

        let queues_swept = meter
            .u64_counter("courier.sweeper.queues.total")
            .with_description("Queues visited by the sweeper")
            .build();

        let messages_persisted = meter
            .u64_counter("courier.sweeper.messages.persisted.total")
            .with_description("Envelopes moved to durable storage")
            .build();

        let messages_discarded = meter
            .u64_counter("courier.sweeper.messages.discarded.total")
            .with_description("Ephemeral envelopes dropped by the sweeper")
            .build();

        let persist_failures = meter
            .u64_counter("courier.sweeper.persist.failures.total")
            .with_description("Durable writes that failed, by reason")
            .build();

        let cursor = Arc::new(AtomicU64::new(0));
        let observed = cursor.clone();
        meter
            .u64_observable_gauge("courier.sweeper.cursor")
            .with_description("Partition the sweeper last visited")
            .with_callback(move |observer| {
                observer.observe(observed.load(Ordering::Relaxed), &[]);
            })
            .build();

        Ok(Self {
            cycles_total,
            cycle_duration_seconds,
            queues_swept,
            messages_persisted,
            messages_discarded,
            persist_failures,
            cursor,
        })
    }

    /// `outcome` is one of `completed`, `timed_out` or `failed`
    pub fn record_cycle(&self, outcome: &'static str, duration_secs: f64) {
        let attributes = [KeyValue::new("outcome", outcome)];
        self.cycles_total.add(1, &attributes);
        self.cycle_duration_seconds.record(duration_secs, &attributes);
    }

    pub fn record_queue_swept(&self, persisted: u64, discarded: u64) {
        self.queues_swept.add(1, &[]);
        if persisted > 0 {
            self.messages_persisted.add(persisted, &[]);
        }
        if discarded > 0 {
            self.messages_discarded.add(discarded, &[]);
        }
    }

    /// `reason` is one of `error` or `timeout`
    pub fn record_persist_failure(&self, reason: &'static str) {
        self.persist_failures
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn set_cursor(&self, partition: u16) {
        self.cursor.store(u64::from(partition), Ordering::Relaxed);
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("courier.sweeper")
}
