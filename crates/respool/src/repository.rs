//! Repository: the external source of truth for which resources exist.
//!
//! The pool reads the canonical list from it and, when supported, asks it
//! to provision or tear down the physical resource behind an id.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::resource::{Resource, ResourceId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("Operation not supported by this repository")]
    Unsupported,
    #[error("Repository operation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Repository<T: Send + 'static>: Send + Sync {
    /// Canonical list of resources that should exist.
    async fn get_all(&self) -> Result<Vec<Resource<T>>, RepositoryError>;

    /// Provision a new resource. `Ok(None)` means nothing could be created.
    async fn create(&self) -> Result<Option<Resource<T>>, RepositoryError> {
        Err(RepositoryError::Unsupported)
    }

    /// Tear down the physical resource behind `id`.
    async fn destroy(&self, _id: &ResourceId) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unsupported)
    }
}

type Factory<T> = dyn Fn() -> Result<Option<Resource<T>>, RepositoryError> + Send + Sync;

/// Repository holding its canonical list in memory.
///
/// Useful for tests and for bootstrapping a pool from a fixed set of
/// resources. `create` is only supported when a factory is configured.
pub struct InMemoryRepository<T> {
    resources: Mutex<Vec<Resource<T>>>,
    factory: Option<Arc<Factory<T>>>,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            factory: None,
        }
    }

    /// Support `create` by calling `factory`. Created resources are added to
    /// the canonical list.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Option<Resource<T>>, RepositoryError> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn add(&self, resource: Resource<T>) {
        self.lock().push(resource);
    }

    pub fn add_all(&self, resources: impl IntoIterator<Item = Resource<T>>) {
        self.lock().extend(resources);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Resource<T>>> {
        match self.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("In-memory repository mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get_all(&self) -> Result<Vec<Resource<T>>, RepositoryError> {
        Ok(self.lock().clone())
    }

    async fn create(&self) -> Result<Option<Resource<T>>, RepositoryError> {
        let factory = self.factory.as_ref().ok_or(RepositoryError::Unsupported)?;
        let created = factory()?;
        if let Some(ref resource) = created {
            self.add(resource.clone());
        }
        Ok(created)
    }

    async fn destroy(&self, id: &ResourceId) -> Result<(), RepositoryError> {
        self.lock().retain(|r| &r.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_get_all() {
        let repo = InMemoryRepository::new();
        repo.add(Resource::with_id("a", 1));
        repo.add_all([Resource::with_id("b", 2), Resource::with_id("c", 3)]);

        let all = repo.get_all().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(repo.len(), 3);
    }

    #[tokio::test]
    async fn create_without_factory_is_unsupported() {
        let repo: InMemoryRepository<u32> = InMemoryRepository::new();
        assert!(matches!(
            repo.create().await,
            Err(RepositoryError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn create_with_factory_records_resource() {
        let repo =
            InMemoryRepository::new().with_factory(|| Ok(Some(Resource::with_id("new", 7))));

        let created = repo.create().await.unwrap().unwrap();
        assert_eq!(created.id.as_str(), "new");
        assert_eq!(repo.get_all().await.unwrap(), vec![created]);
    }

    #[tokio::test]
    async fn destroy_removes_from_list() {
        let repo = InMemoryRepository::new();
        repo.add_all([Resource::with_id("a", 1), Resource::with_id("b", 2)]);

        repo.destroy(&"a".into()).await.unwrap();
        repo.destroy(&"missing".into()).await.unwrap();

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn default_trait_methods_are_unsupported() {
        struct ListOnly;

        #[async_trait]
        impl Repository<()> for ListOnly {
            async fn get_all(&self) -> Result<Vec<Resource<()>>, RepositoryError> {
                Ok(Vec::new())
            }
        }

        assert!(matches!(
            ListOnly.create().await,
            Err(RepositoryError::Unsupported)
        ));
        assert!(matches!(
            ListOnly.destroy(&"x".into()).await,
            Err(RepositoryError::Unsupported)
        ));
    }
}
