//! Storage backends holding the available/acquired state of resources.
//!
//! Every tracked resource is in exactly one of two sets:
//! - `available`: may be handed out by `acquire()`
//! - `acquired`: checked out until `release()` (or a re-`add`)
//!
//! `acquire`, `release` and `remove` are atomic per resource id. For the
//! in-process backend that is a mutex; for Redis it is `MULTI/EXEC` or a
//! server-side script, so it also holds across processes.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::InMemoryStorage;
pub use self::redis::{DEFAULT_PREFIX, RedisKeys, RedisStorage};
use crate::resource::{ReleaseTiming, Resource, ResourceId};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Resource contains no id")]
    InvalidResource,
    #[error("Failed to (de)serialize resource: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Which resources `Storage::get_all` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Snapshot {
    /// Only resources that can currently be acquired.
    #[default]
    Available,
    /// Available and acquired resources. Used by garbage collection.
    All,
}

#[async_trait]
pub trait Storage<T>: Send + Sync {
    /// True when no resource is available. Acquired resources do not count.
    async fn is_empty(&self) -> Result<bool, StorageError>;

    /// Number of tracked resources, available plus acquired.
    async fn count(&self) -> Result<usize, StorageError>;

    /// Number of available resources.
    async fn available_count(&self) -> Result<usize, StorageError>;

    /// Make a resource available.
    ///
    /// Re-adding a tracked id replaces its record and makes it available
    /// again without duplicating it.
    async fn add(&self, resource: Resource<T>) -> Result<(), StorageError>;

    /// Move one available resource to the acquired set.
    async fn acquire(&self) -> Result<Option<Resource<T>>, StorageError>;

    /// Return an acquired resource. `None` if `id` was not acquired.
    async fn release(&self, id: &ResourceId) -> Result<Option<ReleaseTiming>, StorageError>;

    /// Forget a resource entirely. Unknown ids are a no-op.
    async fn remove(&self, id: &ResourceId) -> Result<(), StorageError>;

    async fn get_all(&self, snapshot: Snapshot) -> Result<Vec<Resource<T>>, StorageError>;

    /// Resources that have been acquired for at least `held`.
    async fn acquired_for(&self, held: Duration) -> Result<Vec<Resource<T>>, StorageError>;

    /// Drop every tracked resource.
    async fn reset(&self) -> Result<(), StorageError>;
}
