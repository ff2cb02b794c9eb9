//! respool-sweeper: runs garbage collection against a shared Redis pool.
//!
//! Pool processes only acquire and release; this process evicts what has
//! gone idle. Several sweepers on one prefix are safe, removals are
//! idempotent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use respool::storage::DEFAULT_PREFIX;
use respool::{Pool, PoolConfig, RedisStorage, TracingStats};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
struct SweeperConfig {
    redis_url: String,
    prefix: String,
    interval: Duration,
    /// `EnvFilter` directives: `RUST_LOG` verbatim, else built from `RESPOOL_LOG`.
    log_filter: String,
    log_json: bool,
}

impl SweeperConfig {
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            redis_url: non_blank("RESPOOL_REDIS_URL")
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            prefix: non_blank("RESPOOL_REDIS_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            interval: lookup("RESPOOL_GC_INTERVAL_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_INTERVAL),
            log_filter: non_blank("RUST_LOG").unwrap_or_else(|| {
                let level = match lookup("RESPOOL_LOG").as_deref().map(str::trim) {
                    Some("trace") => "trace",
                    Some("debug") => "debug",
                    Some("warn") | Some("warning") => "warn",
                    Some("error") => "error",
                    _ => "info",
                };
                format!("respool={level},respool_sweeper={level}")
            }),
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.trim().eq_ignore_ascii_case("json")),
        }
    }
}

/// Log to stderr, as text or JSON lines.
fn init_tracing(config: &SweeperConfig) {
    let (filter, rejected) = match EnvFilter::try_new(&config.log_filter) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.log_json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };

    if let Err(e) = installed {
        eprintln!("respool-sweeper: logging already initialized: {e}");
    }
    if let Some(e) = rejected {
        warn!(filter = %config.log_filter, error = %e, "Invalid log filter, using info");
    }
}

/// Resolves on SIGINT or SIGTERM. A handler that fails to install is
/// logged and then never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Collect every `interval` until `shutdown` resolves. Returns the number
/// of completed sweeps.
async fn run<T>(pool: &Pool<T>, interval: Duration, shutdown: impl Future<Output = ()>) -> usize
where
    T: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut sweeps = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = pool.garbage_collect().await;
                sweeps += 1;
                if report.is_clean() {
                    info!(
                        pool = %pool.name(),
                        removed = report.removed(),
                        idle = report.idle_destroyed,
                        stale = report.stale_removed,
                        invalid = report.invalid_destroyed,
                        "Sweep complete"
                    );
                } else {
                    warn!(pool = %pool.name(), ?report, "Sweep completed with errors");
                }
            }
        }
    }
    sweeps
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SweeperConfig::from_env();
    init_tracing(&config);

    let pool_config = PoolConfig::from_env();
    info!(
        pool = %pool_config.name,
        prefix = %config.prefix,
        interval = ?config.interval,
        idle_timeout = ?pool_config.resource_idle_timeout,
        "Starting respool sweeper"
    );

    let storage = RedisStorage::<serde_json::Value>::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?
        .with_prefix(&config.prefix);
    let pool = Pool::new(pool_config)
        .with_storage(Arc::new(storage))
        .with_stats(Arc::new(TracingStats));

    let status = pool.status().await.context("failed to read pool status")?;
    info!(
        available = status.available,
        acquired = status.acquired(),
        total = status.total,
        "Pool status"
    );

    let sweeps = run(&pool, config.interval, shutdown_signal()).await;
    info!(sweeps, "Sweeper shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use respool::Resource;

    use super::*;

    fn from_map(vars: &[(&str, &str)]) -> SweeperConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SweeperConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn config_defaults() {
        let config = from_map(&[]);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.prefix, "resources");
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.log_filter, "respool=info,respool_sweeper=info");
        assert!(!config.log_json);
    }

    #[test]
    fn log_level_from_respool_log() {
        let config = from_map(&[("RESPOOL_LOG", "warning"), ("LOG_FORMAT", "JSON")]);
        assert_eq!(config.log_filter, "respool=warn,respool_sweeper=warn");
        assert!(config.log_json);
    }

    #[test]
    fn rust_log_takes_precedence() {
        let config = from_map(&[("RUST_LOG", "respool=trace,redis=debug"), ("RESPOOL_LOG", "error")]);
        assert_eq!(config.log_filter, "respool=trace,redis=debug");
    }

    #[test]
    fn config_from_env() {
        let config = from_map(&[
            ("RESPOOL_REDIS_URL", "redis://cache:6379/2"),
            ("RESPOOL_REDIS_PREFIX", "workers"),
            ("RESPOOL_GC_INTERVAL_MS", "500"),
        ]);
        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.prefix, "workers");
        assert_eq!(config.interval, Duration::from_millis(500));
    }

    #[test]
    fn config_zero_interval_falls_back() {
        let config = from_map(&[("RESPOOL_GC_INTERVAL_MS", "0"), ("RESPOOL_REDIS_PREFIX", " ")]);
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.prefix, "resources");
    }

    #[tokio::test]
    async fn run_sweeps_until_shutdown() {
        let pool = Pool::<serde_json::Value>::new(
            PoolConfig::new("sweeper").with_idle_timeout(Duration::ZERO),
        );
        pool.register(Resource::with_id("idle", serde_json::json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeps = run(
            &pool,
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(55)),
        )
        .await;

        assert!(sweeps >= 2);
        assert_eq!(pool.storage().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_stops_immediately_on_shutdown() {
        let pool = Pool::<serde_json::Value>::new(PoolConfig::default());
        let sweeps = run(&pool, Duration::from_secs(3600), std::future::ready(())).await;
        assert!(sweeps <= 1);
    }
}
