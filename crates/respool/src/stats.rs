//! Metrics emitted by the pool.
//!
//! Names are `pool.<pool name>.<event>`. Transport is left to the
//! [`StatsSink`] implementation; [`TracingStats`] just logs them.

/// Receives pool metrics.
pub trait StatsSink: Send + Sync {
    fn increment(&self, metric: &str);
    fn gauge(&self, metric: &str, value: f64);
}

/// Events the pool reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEvent {
    AcquireSuccess,
    AcquireMiss,
    Released,
    /// Gauge: how long the released resource was held, in ms.
    ReleasedMillis,
    Destroyed,
    CreateSuccess,
    CreateFail,
    RemovedStale,
    RemovedInvalid,
    RemoveFailure,
}

impl PoolEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEvent::AcquireSuccess => "acquire.success",
            PoolEvent::AcquireMiss => "acquire.miss",
            PoolEvent::Released => "released",
            PoolEvent::ReleasedMillis => "released.millis",
            PoolEvent::Destroyed => "destroyed",
            PoolEvent::CreateSuccess => "create.success",
            PoolEvent::CreateFail => "create.fail",
            PoolEvent::RemovedStale => "removed.stale",
            PoolEvent::RemovedInvalid => "removed.invalid",
            PoolEvent::RemoveFailure => "remove.failure",
        }
    }

    /// Fully qualified metric name for the pool called `pool`.
    pub fn metric(&self, pool: &str) -> String {
        format!("pool.{}.{}", pool, self.as_str())
    }
}

impl std::fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink that reports metrics as `tracing` debug events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn increment(&self, metric: &str) {
        tracing::debug!(metric = %metric, "increment");
    }

    fn gauge(&self, metric: &str, value: f64) {
        tracing::debug!(metric = %metric, value, "gauge");
    }
}
