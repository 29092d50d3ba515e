use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use courier_cache::{CacheStore, MemoryCacheStore};
use courier_common::{Signal, SystemClock, internal, logging};
use courier_limiter::{RateLimiters, RateLimitsConfig};
use courier_mailbox::{
    DurableStore, MemoryDurableStore, MessagesCache, ShardCursor, Sweeper, SweeperConfig,
};
use courier_metrics::MetricsConfig;
use serde::Deserialize;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};

#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    sweeper: SweeperConfig,
    #[serde(alias = "rate_limiters", default)]
    rate_limits: RateLimitsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    /// File the configuration was read from; re-read on SIGHUP
    #[serde(skip)]
    source: Option<PathBuf>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Re-read the configuration whenever SIGHUP arrives and swap the rate
/// limiters whose configuration changed
async fn reload(
    source: Option<PathBuf>,
    limiters: Arc<RateLimiters>,
    sweeper: SweeperConfig,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                let Some(path) = &source else {
                    tracing::warn!("SIGHUP received, but the configuration was not read from a file");
                    continue;
                };

                match Courier::reconfigure(path, &limiters, &sweeper) {
                    Ok(swapped) if swapped.is_empty() => {
                        tracing::info!("Configuration reloaded, no rate limiter changed");
                    }
                    Ok(swapped) => {
                        tracing::info!(limiters = ?swapped, "Configuration reloaded");
                    }
                    Err(err) => {
                        tracing::error!("Configuration reload rejected, keeping current limits: {err:#}");
                    }
                }
            }
            sig = shutdown.recv() => {
                if let Err(err) = sig {
                    tracing::error!("Configuration reloader shutdown channel error: {err}");
                }
                return Ok(());
            }
        }
    }
}

impl Courier {
    /// Read a configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid RON, or
    /// holds an unusable sweeper section.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        let mut courier: Self = ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))?;
        courier
            .sweeper
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))?;
        courier.source = Some(path.to_path_buf());

        Ok(courier)
    }

    pub const fn sweeper(&self) -> &SweeperConfig {
        &self.sweeper
    }

    pub const fn rate_limits(&self) -> &RateLimitsConfig {
        &self.rate_limits
    }

    pub const fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    /// Apply the rate limits found in `path` to `limiters`, returning the
    /// names of the limiters that were swapped. Other sections are only read
    /// at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or holds an invalid
    /// limiter; no limiter is swapped in that case.
    pub fn reconfigure(
        path: &Path,
        limiters: &RateLimiters,
        sweeper: &SweeperConfig,
    ) -> anyhow::Result<Vec<&'static str>> {
        let reloaded = Self::from_file(path)?;

        if reloaded.sweeper != *sweeper {
            tracing::warn!("Sweeper configuration changed; it takes effect after a restart");
        }

        Ok(limiters.reconfigure(&reloaded.rate_limits)?)
    }

    /// Run the sweeper until shutdown, reloading rate limits on SIGHUP
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, metrics cannot be
    /// initialised, or the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        self.sweeper.validate()?;
        logging::init();
        courier_metrics::init_metrics(&self.metrics)?;

        let clock = SystemClock::shared();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::with_clock(clock.clone()));
        let limiters = Arc::new(RateLimiters::new(
            &self.rate_limits,
            store.clone(),
            clock.clone(),
        )?);

        let durable: Arc<dyn DurableStore> = Arc::new(MemoryDurableStore::new());
        let sweeper = Sweeper::new(
            Arc::new(MessagesCache::new(store.clone())),
            durable,
            ShardCursor::new(store),
            self.sweeper,
            clock,
        );

        internal!(level = INFO, "Controller running");

        let ret = tokio::select! {
            () = sweeper.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                Ok(())
            }
            r = reload(self.source.clone(), limiters, self.sweeper, SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use courier_limiter::{Limiter, RateLimiterKind};

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let file = write_config("()");
        let courier = Courier::from_file(file.path()).unwrap();

        assert_eq!(*courier.sweeper(), SweeperConfig::default());
        assert_eq!(*courier.rate_limits(), RateLimitsConfig::default());
        assert_eq!(courier.source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_partial_sections() {
        let file = write_config(
            r#"(
                sweeper: (persist_delay_secs: 60, message_batch_limit: 50),
                rate_limits: (message: (bucket_size: 10, leak_rate_per_minute: 5.0, locking: true)),
                metrics: (enabled: false),
            )"#,
        );
        let courier = Courier::from_file(file.path()).unwrap();

        assert_eq!(courier.sweeper().persist_delay_secs, 60);
        assert_eq!(courier.sweeper().message_batch_limit, 50);
        assert_eq!(
            courier.sweeper().queue_batch_limit,
            SweeperConfig::default().queue_batch_limit
        );
        assert_eq!(courier.rate_limits().message.bucket_size, 10);
        assert!(courier.rate_limits().message.locking);
        assert!(!courier.metrics().enabled);
    }

    #[test]
    fn test_missing_file() {
        let err = Courier::from_file(Path::new("/nonexistent/courier.config.ron")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let file = write_config("(sweeper: (sweep_interval_millis: 0))");
        let err = Courier::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("sweep_interval_millis must be positive"));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_sweeper() {
        let courier = Courier {
            sweeper: SweeperConfig {
                cycle_timeout_secs: 0,
                ..SweeperConfig::default()
            },
            ..Courier::default()
        };
        let err = courier.run().await.unwrap_err();
        assert!(err.to_string().contains("cycle_timeout_secs must be positive"));
    }

    #[test]
    fn test_reload_with_invalid_sweeper_keeps_current_limits() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let limiters =
            RateLimiters::new(&RateLimitsConfig::default(), store, SystemClock::shared()).unwrap();

        let file = write_config(
            "(sweeper: (write_timeout_secs: 0), rate_limits: (lookup: (bucket_size: 7, leak_rate_per_minute: 7.0)))",
        );
        assert!(Courier::reconfigure(file.path(), &limiters, &SweeperConfig::default()).is_err());
        assert_eq!(limiters.config(), RateLimitsConfig::default());
    }

    #[test]
    fn test_reconfigure_swaps_changed_limiters() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let limiters =
            RateLimiters::new(&RateLimitsConfig::default(), store, SystemClock::shared()).unwrap();

        let file = write_config("(rate_limits: (lookup: (bucket_size: 7, leak_rate_per_minute: 7.0)))");
        let swapped =
            Courier::reconfigure(file.path(), &limiters, &SweeperConfig::default()).unwrap();

        assert_eq!(swapped, ["lookup"]);
        assert_eq!(limiters.get(RateLimiterKind::Lookup).config().bucket_size, 7);
    }

    #[test]
    fn test_invalid_reload_keeps_current_limits() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        let limiters =
            RateLimiters::new(&RateLimitsConfig::default(), store, SystemClock::shared()).unwrap();

        let file = write_config(
            "(rate_limits: (lookup: (bucket_size: 7, leak_rate_per_minute: 7.0), message: (bucket_size: 0)))",
        );
        assert!(Courier::reconfigure(file.path(), &limiters, &SweeperConfig::default()).is_err());
        assert_eq!(limiters.config(), RateLimitsConfig::default());
    }
}
