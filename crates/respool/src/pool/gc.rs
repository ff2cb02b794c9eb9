//! Garbage collection: idle, stale and invalid passes.
//!
//! Each pass tolerates failures of its own steps and a failed pass never
//! stops the next one. Passes are not atomic with concurrent
//! acquire/release; a resource released while being evicted just turns the
//! release into a no-op.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::Pool;
use crate::resource::{Resource, ResourceId};
use crate::stats::PoolEvent;
use crate::storage::Snapshot;

/// What one `garbage_collect()` run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub idle_destroyed: usize,
    pub stale_removed: usize,
    pub invalid_destroyed: usize,
    /// Validator calls that errored instead of answering.
    pub validation_errors: usize,
    /// Storage removals or repository teardowns that failed.
    pub destroy_errors: usize,
    /// Passes skipped because a listing could not be read.
    pub skipped_passes: usize,
}

impl GcReport {
    pub fn removed(&self) -> usize {
        self.idle_destroyed + self.stale_removed + self.invalid_destroyed
    }

    pub fn is_clean(&self) -> bool {
        self.validation_errors == 0 && self.destroy_errors == 0 && self.skipped_passes == 0
    }
}

impl<T> Pool<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Sweep idle, stale (with a repository) and invalid (with a validator)
    /// resources. Never fails; problems are logged and counted.
    pub async fn garbage_collect(&self) -> GcReport {
        let mut report = GcReport::default();

        self.remove_idle(&mut report).await;
        if self.repository.is_some() {
            self.remove_stale(&mut report).await;
        }
        if self.validator.is_some() {
            self.remove_invalid(&mut report).await;
        }

        debug!(pool = %self.config.name, ?report, "Garbage collection finished");
        report
    }

    async fn remove_idle(&self, report: &mut GcReport) {
        let idle = match self.idle_resources().await {
            Ok(idle) => idle,
            Err(e) => {
                error!(pool = %self.config.name, error = %e, "GC: failed to list idle resources");
                report.skipped_passes += 1;
                return;
            }
        };

        for resource in idle {
            trace!(pool = %self.config.name, resource = %resource.id, "GC: destroying idle resource");
            report.destroy_errors += self.destroy_counting_failures(&resource.id).await;
            report.idle_destroyed += 1;
        }
    }

    /// Drop resources the repository no longer knows about. Only storage is
    /// touched: there is nothing left to tear down in the repository.
    async fn remove_stale(&self, report: &mut GcReport) {
        let Some(ref repository) = self.repository else {
            return;
        };

        let known: HashSet<ResourceId> = match repository.get_all().await {
            Ok(resources) => resources.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                warn!(pool = %self.config.name, error = %e, "GC: failed to list repository resources");
                report.skipped_passes += 1;
                return;
            }
        };
        let tracked = match self.storage.get_all(Snapshot::All).await {
            Ok(tracked) => tracked,
            Err(e) => {
                error!(pool = %self.config.name, error = %e, "GC: failed to list stored resources");
                report.skipped_passes += 1;
                return;
            }
        };

        for resource in tracked.into_iter().filter(|r| !known.contains(&r.id)) {
            trace!(pool = %self.config.name, resource = %resource.id, "GC: removing stale resource");
            match self.storage.remove(&resource.id).await {
                Ok(()) => {
                    self.emit(PoolEvent::RemovedStale);
                    report.stale_removed += 1;
                }
                Err(e) => {
                    warn!(pool = %self.config.name, resource = %resource.id, error = %e, "GC: failed to remove stale resource");
                    self.emit(PoolEvent::RemoveFailure);
                    report.destroy_errors += 1;
                }
            }
        }
    }

    /// Re-validate available resources plus those only the repository
    /// knows about. Each id is validated once; the stored copy wins.
    async fn remove_invalid(&self, report: &mut GcReport) {
        let Some(ref validator) = self.validator else {
            return;
        };

        let candidates = match self.invalid_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(pool = %self.config.name, error = %e, "GC: failed to list stored resources");
                report.skipped_passes += 1;
                return;
            }
        };

        for resource in candidates {
            let evict = match validator.validate(&resource).await {
                Ok(true) => false,
                Ok(false) => true,
                Err(e) => {
                    warn!(pool = %self.config.name, resource = %resource.id, error = %e, "GC: validation failed");
                    report.validation_errors += 1;
                    self.config.evict_on_validation_error
                }
            };
            if !evict {
                continue;
            }

            trace!(pool = %self.config.name, resource = %resource.id, "GC: evicting invalid resource");
            report.destroy_errors += self.destroy_counting_failures(&resource.id).await;
            self.emit(PoolEvent::RemovedInvalid);
            report.invalid_destroyed += 1;
        }
    }

    async fn invalid_candidates(&self) -> Result<Vec<Resource<T>>, super::PoolError> {
        let mut candidates = self.storage.get_all(Snapshot::Available).await?;

        let Some(ref repository) = self.repository else {
            return Ok(candidates);
        };
        let from_repository = match repository.get_all().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(pool = %self.config.name, error = %e, "GC: validating stored resources only");
                return Ok(candidates);
            }
        };

        // Acquired resources are in use and must not be validated through
        // their repository copy either.
        let mut seen: HashSet<ResourceId> = self
            .storage
            .get_all(Snapshot::All)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        for resource in from_repository {
            if seen.insert(resource.id.clone()) {
                candidates.push(resource);
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::tests::{FlakyRepository, Payload, always, failing_validator, resource};
    use crate::repository::InMemoryRepository;
    use crate::stats::testing::RecordingStats;
    use crate::validate::{FnValidator, ValidationError, Validator};

    fn healthy(id: &str, healthy: bool) -> Resource<Payload> {
        Resource::with_id(id, serde_json::json!({ "healthy": healthy }))
    }

    fn health_check() -> Arc<dyn Validator<Payload>> {
        Arc::new(FnValidator::new(|r: Resource<Payload>| async move {
            Ok(r.payload["healthy"] == serde_json::json!(true))
        }))
    }

    async fn stored_ids(pool: &Pool<Payload>) -> Vec<String> {
        let mut ids: Vec<String> = pool
            .storage()
            .get_all(Snapshot::All)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn empty_pool_collects_nothing() {
        let pool = Pool::<Payload>::new(PoolConfig::new("test"));
        let report = pool.garbage_collect().await;
        assert_eq!(report, GcReport::default());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn idle_resources_are_destroyed() {
        let stats = Arc::new(RecordingStats::default());
        let config = PoolConfig::new("test").with_idle_timeout(Duration::from_millis(100));
        let pool = Pool::new(config).with_stats(stats.clone());

        pool.register(resource("never-used")).await.unwrap();
        pool.register(resource("released-late")).await.unwrap();
        let held = pool.acquire().await.unwrap().unwrap();
        assert_eq!(held.id.as_str(), "released-late");

        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.release(&held.id).await.unwrap();
        pool.register(resource("fresh")).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.idle_destroyed, 1);
        assert_eq!(stored_ids(&pool).await, ["fresh", "released-late"]);
        assert_eq!(stats.count("pool.test.destroyed"), 1);
    }

    #[tokio::test]
    async fn acquired_resources_survive_idle_pass() {
        let config = PoolConfig::new("test").with_idle_timeout(Duration::from_millis(10));
        let pool = Pool::new(config);
        pool.register(resource("busy")).await.unwrap();
        pool.acquire().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = pool.garbage_collect().await;
        assert_eq!(report.idle_destroyed, 0);
        assert_eq!(stored_ids(&pool).await, ["busy"]);
    }

    #[tokio::test]
    async fn stale_resources_are_removed() {
        let repository = Arc::new(FlakyRepository::default());
        repository.resources.add(resource("known"));
        let stats = Arc::new(RecordingStats::default());
        let pool = Pool::new(PoolConfig::new("test"))
            .with_repository(repository.clone())
            .with_stats(stats.clone());
        pool.initialize().await.unwrap();
        pool.register(resource("orphan")).await.unwrap();
        pool.register(resource("orphan-in-use")).await.unwrap();
        let in_use = pool.acquire().await.unwrap().unwrap();
        assert_eq!(in_use.id.as_str(), "orphan-in-use");

        let report = pool.garbage_collect().await;
        assert_eq!(report.stale_removed, 2);
        assert_eq!(stored_ids(&pool).await, ["known"]);
        assert_eq!(stats.count("pool.test.removed.stale"), 2);

        // Stale removal never reaches into the repository.
        assert!(repository.destroyed.lock().unwrap().is_empty());
        // The holder's release turns into a no-op.
        assert!(pool.release(&in_use.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_pass_skipped_without_repository() {
        let pool = Pool::new(PoolConfig::new("test"));
        pool.register(resource("r1")).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.stale_removed, 0);
        assert_eq!(stored_ids(&pool).await, ["r1"]);
    }

    #[tokio::test]
    async fn invalid_resources_are_destroyed() {
        let stats = Arc::new(RecordingStats::default());
        let pool = Pool::new(PoolConfig::new("test"))
            .with_validator(health_check())
            .with_stats(stats.clone());

        // Storage writes bypass register-time validation.
        pool.storage().add(healthy("good", true)).await.unwrap();
        pool.storage().add(healthy("bad", false)).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.invalid_destroyed, 1);
        assert_eq!(stored_ids(&pool).await, ["good"]);
        assert_eq!(stats.count("pool.test.removed.invalid"), 1);
        assert_eq!(stats.count("pool.test.destroyed"), 1);
    }

    #[tokio::test]
    async fn validation_errors_leave_resource_in_place() {
        let pool = Pool::new(PoolConfig::new("test")).with_validator(failing_validator());
        pool.storage().add(resource("flaky")).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.validation_errors, 1);
        assert_eq!(report.invalid_destroyed, 0);
        assert!(!report.is_clean());
        assert_eq!(stored_ids(&pool).await, ["flaky"]);
    }

    #[tokio::test]
    async fn validation_errors_evict_when_configured() {
        let config = PoolConfig::new("test").with_evict_on_validation_error(true);
        let pool = Pool::new(config).with_validator(failing_validator());
        pool.storage().add(resource("flaky")).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.validation_errors, 1);
        assert_eq!(report.invalid_destroyed, 1);
        assert!(stored_ids(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn one_failing_validation_does_not_stop_the_sweep() {
        let validator = FnValidator::new(|r: Resource<Payload>| async move {
            match r.id.as_str() {
                "flaky" => Err(ValidationError("timeout".to_string())),
                "bad" => Ok(false),
                _ => Ok(true),
            }
        });
        let pool = Pool::new(PoolConfig::new("test")).with_validator(Arc::new(validator));
        for id in ["bad", "flaky", "good"] {
            pool.storage().add(resource(id)).await.unwrap();
        }

        let report = pool.garbage_collect().await;
        assert_eq!(report.validation_errors, 1);
        assert_eq!(report.invalid_destroyed, 1);
        assert_eq!(stored_ids(&pool).await, ["flaky", "good"]);
    }

    #[tokio::test]
    async fn repository_only_resources_are_validated() {
        let repository = Arc::new(FlakyRepository::default());
        repository.resources.add(healthy("remote-bad", false));
        let pool = Pool::new(PoolConfig::new("test"))
            .with_repository(repository.clone())
            .with_validator(health_check());

        let report = pool.garbage_collect().await;
        assert_eq!(report.invalid_destroyed, 1);
        assert_eq!(
            repository.destroyed.lock().unwrap().as_slice(),
            &[ResourceId::from("remote-bad")]
        );
        assert!(repository.resources.is_empty());
    }

    #[tokio::test]
    async fn resources_in_both_are_validated_once() {
        let repository = Arc::new(InMemoryRepository::new());
        repository.add(resource("shared"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let validator = FnValidator::new(move |_: Resource<Payload>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        });
        let pool = Pool::new(PoolConfig::new("test"))
            .with_repository(repository)
            .with_validator(Arc::new(validator));
        pool.initialize().await.unwrap();
        let after_register = calls.load(Ordering::SeqCst);

        pool.garbage_collect().await;
        assert_eq!(calls.load(Ordering::SeqCst) - after_register, 1);
    }

    #[tokio::test]
    async fn acquired_resources_are_not_revalidated() {
        let repository = Arc::new(InMemoryRepository::new());
        repository.add(resource("busy"));
        let pool = Pool::new(PoolConfig::new("test"))
            .with_repository(repository.clone())
            .with_validator(always(true));
        pool.initialize().await.unwrap();
        pool.acquire().await.unwrap().unwrap();

        let pool = Pool::new(PoolConfig::new("test"))
            .with_storage(Arc::clone(pool.storage()))
            .with_repository(repository)
            .with_validator(always(false));

        let report = pool.garbage_collect().await;
        assert_eq!(report.invalid_destroyed, 0);
        assert_eq!(stored_ids(&pool).await, ["busy"]);
    }

    #[tokio::test]
    async fn destroy_failures_are_counted() {
        let repository = Arc::new(FlakyRepository {
            fail_destroy: true,
            ..Default::default()
        });
        repository.resources.add(healthy("bad", false));
        let pool = Pool::new(PoolConfig::new("test"))
            .with_repository(repository.clone())
            .with_validator(health_check());
        pool.storage().add(healthy("bad", false)).await.unwrap();

        let report = pool.garbage_collect().await;
        assert_eq!(report.invalid_destroyed, 1);
        assert_eq!(report.destroy_errors, 1);
        // Storage removal still went through.
        assert!(stored_ids(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn report_serializes_for_logs() {
        let report = GcReport {
            idle_destroyed: 2,
            stale_removed: 1,
            invalid_destroyed: 0,
            validation_errors: 1,
            destroy_errors: 0,
            skipped_passes: 0,
        };
        assert_eq!(report.removed(), 3);
        insta::assert_json_snapshot!("gc_report", report);
    }
}
