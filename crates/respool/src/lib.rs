//! respool: a generic pool of reusable, expensive-to-create resources.
//!
//! Resources are acquired by callers, used, and released back. Several
//! [`Pool`] instances, in one process or many, can share one [`Storage`];
//! the Redis backend keeps acquire/release atomic across processes.
//!
//! ```ignore
//! let pool = Pool::new(PoolConfig::new("workers").with_max(8))
//!     .with_storage(Arc::new(RedisStorage::connect("redis://127.0.0.1/0").await?))
//!     .with_repository(repository)
//!     .with_validator(validator);
//! pool.initialize().await?;
//!
//! if let Some(resource) = pool.acquire().await? {
//!     // ... use resource.payload ...
//!     pool.release(&resource.id).await?;
//! }
//! ```

mod config;
mod pool;
mod repository;
mod resource;
mod stats;
pub mod storage;
mod validate;

pub use config::PoolConfig;
pub use pool::{GcReport, Pool, PoolError, PoolStatus};
pub use repository::{InMemoryRepository, Repository, RepositoryError};
pub use resource::{ReleaseTiming, Resource, ResourceId};
pub use stats::{PoolEvent, StatsSink, TracingStats};
pub use storage::{InMemoryStorage, RedisKeys, RedisStorage, Snapshot, Storage, StorageError};
pub use validate::{FnValidator, ValidationError, Validator};
