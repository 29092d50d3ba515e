//! OpenTelemetry metrics for courier
//!
//! Metrics are pushed over OTLP/HTTP to an OpenTelemetry Collector.
//!
//! - **Mailbox**: inserts, removals, notifications, displaced subscribers
//! - **Sweeper**: cycle outcomes and durations, persisted envelopes, cursor position
//! - **Rate limits**: checks, rejections, fail-open decisions
//!
//! Recording sites look the instance up with [`try_metrics`] and skip
//! recording when metrics were never initialised.

mod config;
mod error;
mod exporter;
mod limiter;
mod mailbox;
mod sweeper;

pub use config::MetricsConfig;
pub use error::MetricsError;
pub use limiter::RateLimitMetrics;
pub use mailbox::MailboxMetrics;
use once_cell::sync::OnceCell;
pub use sweeper::SweeperMetrics;

static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub mailbox: MailboxMetrics,
    pub sweeper: SweeperMetrics,
    pub ratelimit: RateLimitMetrics,
}

impl Metrics {
    /// Create every instrument against the current global meter provider
    ///
    /// # Errors
    ///
    /// Returns an error if an instrument cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            mailbox: MailboxMetrics::new()?,
            sweeper: SweeperMetrics::new()?,
            ratelimit: RateLimitMetrics::new()?,
        })
    }
}

/// Initialize the metrics system
///
/// Must be called once at startup, before anything is recorded. A disabled
/// config makes this a no-op.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or if called twice.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics collection is disabled");
        return Ok(());
    }

    tracing::info!(
        endpoint = %config.endpoint,
        "Initializing OpenTelemetry metrics with OTLP exporter"
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    opentelemetry::global::set_meter_provider(provider);

    METRICS_INSTANCE
        .set(Metrics::new()?)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!("Metrics collection initialized successfully");

    Ok(())
}

/// The global metrics instance, if [`init_metrics`] enabled it
#[must_use]
pub fn try_metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
