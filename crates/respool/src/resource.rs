//! Resource records tracked by the pool.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a pooled resource.
///
/// An empty id means "not assigned yet"; the pool assigns a UUID v4 on
/// registration and storage refuses to track a resource without one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An application payload plus the bookkeeping the pool keeps about it.
///
/// The payload is opaque to the pool. Storage owns the record while the
/// resource is tracked and stamps the timestamps on each state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource<T> {
    pub id: ResourceId,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_acquired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_released_at: Option<DateTime<Utc>>,
}

impl<T> Resource<T> {
    /// Wrap a payload without an id. The pool assigns one on registration.
    pub fn new(payload: T) -> Self {
        Self::with_id(ResourceId::default(), payload)
    }

    pub fn with_id(id: impl Into<ResourceId>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            registered_at: None,
            last_acquired_at: None,
            last_released_at: None,
        }
    }

    /// Time of the last release, or of registration for a resource that was
    /// never released. Used to decide idleness.
    pub fn last_touched_at(&self) -> Option<DateTime<Utc>> {
        self.last_released_at.or(self.registered_at)
    }

    /// True when the resource has not been touched since `cutoff`.
    ///
    /// A record with neither timestamp is never idle: it did not go through
    /// registration, so there is nothing to measure against.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_touched_at().is_some_and(|t| t < cutoff)
    }
}

/// Timing of one acquire/release cycle, returned by `Storage::release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTiming {
    pub acquired_at: DateTime<Utc>,
    pub released_at: DateTime<Utc>,
}

impl ReleaseTiming {
    /// How long the resource was held. Clock skew between processes can
    /// make this negative; it is clamped to zero.
    pub fn held_for(&self) -> Duration {
        (self.released_at - self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Milliseconds since the Unix epoch, the score unit used by the Redis
/// `acquired` set.
pub(crate) fn epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// The instant `ago` before now, saturating at the earliest representable time.
pub(crate) fn cutoff(ago: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ago)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
