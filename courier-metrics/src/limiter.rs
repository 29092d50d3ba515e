//! Rate limiter metrics

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

use crate::MetricsError;

#[derive(Debug)]
pub struct RateLimitMetrics {
    checks_total: Counter<u64>,
    exceeded_total: Counter<u64>,
    fail_open_total: Counter<u64>,
}

impl RateLimitMetrics {
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        Ok(Self {
            checks_total: meter
                .u64_counter("courier.ratelimit.checks.total")
                .with_description("Rate limit checks, by limiter and outcome")
                .build(),
            exceeded_total: meter
                .u64_counter("courier.ratelimit.exceeded.total")
                .with_description("Rate limit rejections reported, by limiter")
                .build(),
            fail_open_total: meter
                .u64_counter("courier.ratelimit.fail_open.total")
                .with_description("Checks allowed because the limiter state was unusable")
                .build(),
        })
    }

    pub fn record_check(&self, limiter: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "exceeded" };
        self.checks_total.add(
            1,
            &[
                KeyValue::new("limiter", limiter.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    pub fn record_exceeded(&self, limiter: &str) {
        self.exceeded_total
            .add(1, &[KeyValue::new("limiter", limiter.to_string())]);
    }

    /// `reason` is one of `unavailable` or `corrupt`
    pub fn record_fail_open(&self, limiter: &str, reason: &'static str) {
        self.fail_open_total.add(
            1,
            &[
                KeyValue::new("limiter", limiter.to_string()),
                KeyValue::new("reason", reason),
            ],
        );
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("courier.ratelimit")
}
