//! Transient message queue metrics

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

use crate::MetricsError;

#[derive(Debug)]
pub struct MailboxMetrics {
    messages_inserted: Counter<u64>,
    messages_removed: Counter<u64>,
    notifications_published: Counter<u64>,
    subscribers_displaced: Counter<u64>,
}

impl MailboxMetrics {
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        Ok(Self {
            messages_inserted: meter
                .u64_counter("courier.mailbox.messages.inserted.total")
                .with_description("Envelopes appended to transient queues")
                .build(),
            messages_removed: meter
                .u64_counter("courier.mailbox.messages.removed.total")
                .with_description("Envelopes removed from transient queues, by reason")
                .build(),
            notifications_published: meter
                .u64_counter("courier.mailbox.notifications.total")
                .with_description("Queue notifications published, by kind")
                .build(),
            subscribers_displaced: meter
                .u64_counter("courier.mailbox.subscribers.displaced.total")
                .with_description("Queue subscribers replaced by a newer subscriber")
                .build(),
        })
    }

    pub fn record_inserted(&self, ephemeral: bool) {
        self.messages_inserted
            .add(1, &[KeyValue::new("ephemeral", ephemeral)]);
    }

    /// `reason` is one of `acknowledged`, `cleared` or `persisted`
    pub fn record_removed(&self, reason: &'static str, count: u64) {
        if count > 0 {
            self.messages_removed
                .add(count, &[KeyValue::new("reason", reason)]);
        }
    }

    pub fn record_notification(&self, kind: &'static str) {
        self.notifications_published
            .add(1, &[KeyValue::new("kind", kind)]);
    }

    pub fn record_displaced(&self) {
        self.subscribers_displaced.add(1, &[]);
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("courier.mailbox")
}
