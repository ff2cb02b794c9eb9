//! Pool: the public lifecycle of pooled resources.
//!
//! Flow:
//! 1. `initialize()` loads the repository's resources into empty storage
//! 2. `acquire()` takes an available resource, or creates one on demand
//!    when the pool is empty and below `max`
//! 3. `release()` returns it, `destroy()` removes it for good
//! 4. `garbage_collect()` sweeps idle, stale and invalid resources
//!
//! The pool is the only writer of its storage. Several pools may share one
//! storage (in-process clones or the same Redis prefix); correctness then
//! rests on the storage's atomic operations.

mod gc;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

pub use self::gc::GcReport;
use crate::config::PoolConfig;
use crate::repository::{Repository, RepositoryError};
use crate::resource::{ReleaseTiming, Resource, ResourceId, cutoff};
use crate::stats::{PoolEvent, StatsSink};
use crate::storage::{InMemoryStorage, Snapshot, Storage, StorageError};
use crate::validate::{ValidationError, Validator};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub available: usize,
    pub total: usize,
    pub max: Option<usize>,
}

impl PoolStatus {
    pub fn acquired(&self) -> usize {
        self.total.saturating_sub(self.available)
    }

    /// No resource available and no room to create one.
    pub fn is_exhausted(&self) -> bool {
        self.available == 0 && self.max.is_some_and(|max| self.total >= max)
    }
}

pub struct Pool<T: Send + 'static> {
    config: PoolConfig,
    storage: Arc<dyn Storage<T>>,
    repository: Option<Arc<dyn Repository<T>>>,
    validator: Option<Arc<dyn Validator<T>>>,
    stats: Option<Arc<dyn StatsSink>>,
}

impl<T> Pool<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a pool backed by a fresh in-memory storage.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            storage: Arc::new(InMemoryStorage::new()),
            repository: None,
            validator: None,
            stats: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage<T>>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository<T>>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator<T>>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage<T>> {
        &self.storage
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        Ok(PoolStatus {
            available: self.storage.available_count().await?,
            total: self.storage.count().await?,
            max: self.config.max,
        })
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(ref stats) = self.stats {
            stats.increment(&event.metric(&self.config.name));
        }
    }

    fn emit_gauge(&self, event: PoolEvent, value: f64) {
        if let Some(ref stats) = self.stats {
            stats.gauge(&event.metric(&self.config.name), value);
        }
    }

    /// Load the repository's resources into storage.
    ///
    /// Does nothing when storage already tracks resources, so pools sharing
    /// a storage and a repository do not load the same resources twice.
    /// Returns how many resources were registered.
    pub async fn initialize(&self) -> Result<usize, PoolError> {
        let Some(ref repository) = self.repository else {
            return Ok(0);
        };
        if self.storage.count().await? > 0 {
            debug!(pool = %self.config.name, "Storage already populated, skipping initial load");
            return Ok(0);
        }

        let mut registered = 0;
        for resource in repository.get_all().await? {
            trace!(pool = %self.config.name, resource = %resource.id, "Init: adding from repository");
            if self.register(resource).await?.is_some() {
                registered += 1;
            }
        }
        info!(pool = %self.config.name, registered, "Pool initialized from repository");
        Ok(registered)
    }

    /// Put a resource into the pool.
    ///
    /// Assigns an id when missing and stamps `registered_at` on first entry.
    /// With a validator configured, a resource that does not pass is dropped
    /// silently. Returns the id under which the resource was stored.
    pub async fn register(&self, mut resource: Resource<T>) -> Result<Option<ResourceId>, PoolError> {
        if resource.id.is_empty() {
            resource.id = ResourceId::generate();
        }
        if resource.registered_at.is_none() {
            resource.registered_at = Some(Utc::now());
        }

        if let Some(ref validator) = self.validator {
            match validator.validate(&resource).await {
                Ok(true) => {}
                Ok(false) => {
                    trace!(pool = %self.config.name, resource = %resource.id, "Not registering invalid resource");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(pool = %self.config.name, resource = %resource.id, error = %e, "Validation failed during register");
                    return Ok(None);
                }
            }
        }

        let id = resource.id.clone();
        self.storage.add(resource).await?;
        debug!(pool = %self.config.name, resource = %id, "Registered resource");
        Ok(Some(id))
    }

    /// Check out a resource.
    ///
    /// Falls back to creating one through the repository when nothing is
    /// available and the pool is below `max`. `None` is a miss: empty and
    /// at capacity, or creation failed.
    pub async fn acquire(&self) -> Result<Option<Resource<T>>, PoolError> {
        let acquired = self.acquire_or_create().await;
        match acquired {
            Ok(Some(_)) => self.emit(PoolEvent::AcquireSuccess),
            Ok(None) | Err(_) => self.emit(PoolEvent::AcquireMiss),
        }
        acquired
    }

    async fn acquire_or_create(&self) -> Result<Option<Resource<T>>, PoolError> {
        if let Some(resource) = self.storage.acquire().await? {
            return Ok(Some(resource));
        }

        if let Some(max) = self.config.max {
            let count = self.storage.count().await?;
            if count >= max {
                debug!(pool = %self.config.name, count, max, "Pool at capacity");
                return Ok(None);
            }
        }

        let Some(created) = self.try_create().await else {
            return Ok(None);
        };

        let id = created.id.clone();
        match self.register(created).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.destroy(&id).await;
                return Ok(None);
            }
            Err(e) => {
                self.destroy(&id).await;
                return Err(e);
            }
        }

        // Concurrent acquires can all pass the capacity check before any of
        // them registers. Roll back ours if that pushed the pool past `max`.
        if let Some(max) = self.config.max {
            let count = self.storage.count().await?;
            if count > max {
                debug!(pool = %self.config.name, resource = %id, count, max, "Created past capacity, rolling back");
                self.destroy(&id).await;
                return Ok(None);
            }
        }

        // Take it through storage like any other acquisition, so it is
        // marked acquired and stamped.
        Ok(self.storage.acquire().await?)
    }

    /// Return an acquired resource to the pool.
    ///
    /// Unknown or empty ids are ignored. Returns the hold timing when the
    /// resource was actually released.
    pub async fn release(&self, id: &ResourceId) -> Result<Option<ReleaseTiming>, PoolError> {
        if id.is_empty() {
            return Ok(None);
        }
        let timing = self.storage.release(id).await?;
        match timing {
            Some(timing) => {
                self.emit(PoolEvent::Released);
                self.emit_gauge(
                    PoolEvent::ReleasedMillis,
                    timing.held_for().as_millis() as f64,
                );
                debug!(pool = %self.config.name, resource = %id, held = ?timing.held_for(), "Released resource");
            }
            None => {
                debug!(pool = %self.config.name, resource = %id, "Release of resource that was not acquired");
            }
        }
        Ok(timing)
    }

    /// Permanently remove a resource from storage and the repository.
    ///
    /// Both teardowns are attempted independently; failures are logged and
    /// never returned.
    pub async fn destroy(&self, id: &ResourceId) {
        self.destroy_counting_failures(id).await;
    }

    /// `destroy`, reporting how many of the two teardowns failed.
    async fn destroy_counting_failures(&self, id: &ResourceId) -> usize {
        if id.is_empty() {
            return 0;
        }
        let mut failures = 0;

        if let Err(e) = self.storage.remove(id).await {
            warn!(pool = %self.config.name, resource = %id, error = %e, "Failed to remove resource from storage");
            self.emit(PoolEvent::RemoveFailure);
            failures += 1;
        }

        if let Some(ref repository) = self.repository {
            match repository.destroy(id).await {
                Ok(()) | Err(RepositoryError::Unsupported) => {}
                Err(e) => {
                    warn!(pool = %self.config.name, resource = %id, error = %e, "Failed to destroy resource in repository");
                    failures += 1;
                }
            }
        }

        self.emit(PoolEvent::Destroyed);
        debug!(pool = %self.config.name, resource = %id, failures, "Destroyed resource");
        failures
    }

    /// Create a resource through the repository and wait until it is valid.
    ///
    /// Every failure ends in `None`: no repository, `create` unsupported or
    /// yielding nothing, an error, or a resource that never became valid
    /// (which is then destroyed).
    pub async fn try_create(&self) -> Option<Resource<T>> {
        let repository = self.repository.as_ref()?;

        let mut created = match repository.create().await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                debug!(pool = %self.config.name, "Repository created nothing");
                self.emit(PoolEvent::CreateFail);
                return None;
            }
            Err(RepositoryError::Unsupported) => return None,
            Err(e) => {
                warn!(pool = %self.config.name, error = %e, "Failed to create resource");
                self.emit(PoolEvent::CreateFail);
                return None;
            }
        };

        // Without an id it could be neither stored nor torn down.
        if created.id.is_empty() {
            created.id = ResourceId::generate();
        }

        match self.wait_for_in_service(&created).await {
            Ok(true) => {
                self.emit(PoolEvent::CreateSuccess);
                debug!(pool = %self.config.name, resource = %created.id, "Created resource");
                return Some(created);
            }
            Ok(false) => {
                warn!(
                    pool = %self.config.name,
                    resource = %created.id,
                    timeout = ?self.config.in_service_wait_timeout,
                    "Created resource never became valid"
                );
            }
            Err(e) => {
                warn!(pool = %self.config.name, resource = %created.id, error = %e, "Validation of created resource failed");
            }
        }

        self.emit(PoolEvent::CreateFail);
        self.destroy(&created.id).await;
        None
    }

    /// Poll the validator until the resource passes or the in-service
    /// timeout elapses. Without a validator every resource is in service.
    pub async fn wait_for_in_service(&self, resource: &Resource<T>) -> Result<bool, ValidationError> {
        let Some(ref validator) = self.validator else {
            return Ok(true);
        };

        let deadline = tokio::time::Instant::now() + self.config.in_service_wait_timeout;
        loop {
            if validator.validate(resource).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = self.config.in_service_poll_interval.min(deadline - now);
            trace!(pool = %self.config.name, resource = %resource.id, ?wait, "Waiting for resource to come into service");
            tokio::time::sleep(wait).await;
        }
    }

    /// Available resources untouched for longer than the idle timeout.
    ///
    /// "Touched" is the last release, or registration for resources never
    /// released. Acquired resources are never idle.
    pub async fn idle_resources(&self) -> Result<Vec<Resource<T>>, PoolError> {
        let cutoff = cutoff(self.config.resource_idle_timeout);
        let available = self.storage.get_all(Snapshot::Available).await?;
        Ok(available
            .into_iter()
            .filter(|r| r.is_idle_since(cutoff))
            .collect())
    }
}
