//! Pool configuration.

use std::time::Duration;

pub const DEFAULT_NAME: &str = "default";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IN_SERVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IN_SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Used to namespace metrics: `pool.<name>.<event>`.
    pub name: String,
    /// Cap on tracked resources (available + acquired). Only limits
    /// on-demand creation; registration is never refused. Creation rechecks
    /// the count after registering and rolls back a resource that went
    /// over, so concurrent acquires near the cap may miss.
    pub max: Option<usize>,
    /// Available resources untouched for longer than this are collected.
    pub resource_idle_timeout: Duration,
    /// How long a freshly created resource may take to pass validation.
    pub in_service_wait_timeout: Duration,
    pub in_service_poll_interval: Duration,
    /// Destroy resources whose validation errors during garbage collection.
    /// Off by default: an erroring resource stays for the next sweep.
    pub evict_on_validation_error: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            max: None,
            resource_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            in_service_wait_timeout: DEFAULT_IN_SERVICE_WAIT_TIMEOUT,
            in_service_poll_interval: DEFAULT_IN_SERVICE_POLL_INTERVAL,
            evict_on_validation_error: false,
        }
    }
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build from `RESPOOL_*` environment variables. Unset or unparsable
    /// values fall back to the defaults.
    ///
    /// - `RESPOOL_NAME`
    /// - `RESPOOL_MAX`
    /// - `RESPOOL_IDLE_TIMEOUT_MS`
    /// - `RESPOOL_IN_SERVICE_TIMEOUT_MS`
    /// - `RESPOOL_IN_SERVICE_POLL_MS`
    /// - `RESPOOL_EVICT_ON_VALIDATION_ERROR` (`1`/`true`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let defaults = Self::default();

        Self {
            name: lookup("RESPOOL_NAME")
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(defaults.name),
            max: lookup("RESPOOL_MAX").and_then(|v| v.trim().parse().ok()),
            resource_idle_timeout: millis("RESPOOL_IDLE_TIMEOUT_MS")
                .unwrap_or(defaults.resource_idle_timeout),
            in_service_wait_timeout: millis("RESPOOL_IN_SERVICE_TIMEOUT_MS")
                .unwrap_or(defaults.in_service_wait_timeout),
            in_service_poll_interval: millis("RESPOOL_IN_SERVICE_POLL_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.in_service_poll_interval),
            evict_on_validation_error: lookup("RESPOOL_EVICT_ON_VALIDATION_ERROR")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.evict_on_validation_error),
        }
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.resource_idle_timeout = timeout;
        self
    }

    pub fn with_in_service_wait_timeout(mut self, timeout: Duration) -> Self {
        self.in_service_wait_timeout = timeout;
        self
    }

    pub fn with_in_service_poll_interval(mut self, interval: Duration) -> Self {
        self.in_service_poll_interval = interval;
        self
    }

    pub fn with_evict_on_validation_error(mut self, evict: bool) -> Self {
        self.evict_on_validation_error = evict;
        self
    }
}
