//! In-process storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Snapshot, Storage, StorageError};
use crate::resource::{ReleaseTiming, Resource, ResourceId, cutoff};

struct State<T> {
    /// Available ids in insertion order; `acquire` pops from the back.
    available: Vec<ResourceId>,
    /// Acquired ids and when they were acquired.
    acquired: HashMap<ResourceId, DateTime<Utc>>,
    records: HashMap<ResourceId, Resource<T>>,
}

impl<T> State<T> {
    fn forget(&mut self, id: &ResourceId) {
        self.available.retain(|a| a != id);
        self.acquired.remove(id);
        self.records.remove(id);
    }
}

/// Storage for a single process.
///
/// Clones share the same state, so several pools built from clones of one
/// `InMemoryStorage` see each other's resources.
pub struct InMemoryStorage<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> InMemoryStorage<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: Vec::new(),
                acquired: HashMap::new(),
                records: HashMap::new(),
            })),
        }
    }

    /// Lock the state. The critical sections never leave it half-updated,
    /// so a poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("In-memory storage mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for InMemoryStorage<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl<T> Storage<T> for InMemoryStorage<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.lock().available.is_empty())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let state = self.lock();
        Ok(state.available.len() + state.acquired.len())
    }

    async fn available_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock().available.len())
    }

    async fn add(&self, resource: Resource<T>) -> Result<(), StorageError> {
        if resource.id.is_empty() {
            return Err(StorageError::InvalidResource);
        }
        let mut state = self.lock();
        let id = resource.id.clone();
        state.forget(&id);
        state.available.push(id.clone());
        state.records.insert(id, resource);
        Ok(())
    }

    async fn acquire(&self) -> Result<Option<Resource<T>>, StorageError> {
        let mut state = self.lock();
        let Some(id) = state.available.pop() else {
            return Ok(None);
        };
        let now = Utc::now();
        state.acquired.insert(id.clone(), now);
        let record = state.records.get_mut(&id).map(|r| {
            r.last_acquired_at = Some(now);
            r.clone()
        });
        tracing::debug!(resource = %id, "Acquired from memory storage");
        Ok(record)
    }

    async fn release(&self, id: &ResourceId) -> Result<Option<ReleaseTiming>, StorageError> {
        let mut state = self.lock();
        let Some(acquired_at) = state.acquired.remove(id) else {
            return Ok(None);
        };
        let released_at = Utc::now();
        if let Some(record) = state.records.get_mut(id) {
            record.last_released_at = Some(released_at);
        }
        state.available.push(id.clone());
        Ok(Some(ReleaseTiming {
            acquired_at,
            released_at,
        }))
    }

    async fn remove(&self, id: &ResourceId) -> Result<(), StorageError> {
        self.lock().forget(id);
        Ok(())
    }

    async fn get_all(&self, snapshot: Snapshot) -> Result<Vec<Resource<T>>, StorageError> {
        let state = self.lock();
        let mut ids: Vec<&ResourceId> = state.available.iter().collect();
        if snapshot == Snapshot::All {
            ids.extend(state.acquired.keys());
        }
        Ok(ids
            .into_iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn acquired_for(&self, held: Duration) -> Result<Vec<Resource<T>>, StorageError> {
        let cutoff = cutoff(held);
        let state = self.lock();
        Ok(state
            .acquired
            .iter()
            .filter(|(_, at)| **at <= cutoff)
            .filter_map(|(id, _)| state.records.get(id).cloned())
            .collect())
    }

    async fn reset(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.available.clear();
        state.acquired.clear();
        state.records.clear();
        Ok(())
    }
}
