//! Redis-backed storage shared by pools in different processes.
//!
//! Layout (prefix defaults to `resources`):
//! - `<prefix>:pool`: list of available ids, pushed on the right, popped on the left
//! - `<prefix>:acquired`: sorted set of acquired ids scored by acquisition time (ms)
//! - `<prefix>:ids`: hash of id -> JSON record, the only copy of the payload
//!
//! Writes touching several keys go through `MULTI/EXEC`. `acquire` and
//! `release` need to branch on the current state, so they run as Lua
//! scripts, which Redis executes atomically as well.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Snapshot, Storage, StorageError};
use crate::resource::{
    ReleaseTiming, Resource, ResourceId, cutoff, epoch_millis, from_epoch_millis,
};

pub const DEFAULT_PREFIX: &str = "resources";

/// Pops the first available id that still has a record and marks it acquired.
///
/// KEYS: pool, acquired, ids. ARGV: acquisition time in ms.
/// Returns `{id, json}` or nil when nothing is available.
const ACQUIRE_SCRIPT: &str = r"
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return false
  end
  local json = redis.call('HGET', KEYS[3], id)
  if json then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
    return {id, json}
  end
end
";

/// Rewrites a record only while it is still acquired.
///
/// KEYS: acquired, ids. ARGV: id, json.
const STAMP_ACQUIRED_SCRIPT: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
  return 1
end
return 0
";

/// Moves an acquired id back to the pool and stores its updated record.
///
/// KEYS: pool, acquired, ids. ARGV: id, json.
/// Returns the acquisition time in ms, or nil when the id was not acquired.
const RELEASE_SCRIPT: &str = r"
local at = redis.call('ZSCORE', KEYS[2], ARGV[1])
if not at then
  return false
end
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
  redis.call('ZREM', KEYS[2], ARGV[1])
  return false
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
return tonumber(at)
";

/// Key names used by one logical pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    pub pool: String,
    pub acquired: String,
    pub ids: String,
}

impl RedisKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            pool: format!("{prefix}:pool"),
            acquired: format!("{prefix}:acquired"),
            ids: format!("{prefix}:ids"),
        }
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

struct Scripts {
    acquire: Script,
    stamp_acquired: Script,
    release: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            acquire: Script::new(ACQUIRE_SCRIPT),
            stamp_acquired: Script::new(STAMP_ACQUIRED_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

/// Storage backed by Redis.
///
/// Every pool instance pointing at the same server and prefix shares the
/// same resources, so acquisition is exclusive across processes.
pub struct RedisStorage<T> {
    conn: ConnectionManager,
    keys: RedisKeys,
    scripts: Scripts,
    _payload: PhantomData<fn() -> T>,
}

impl<T> RedisStorage<T> {
    /// Wrap an existing connection. The storage owns its handle; clones of a
    /// `ConnectionManager` multiplex over one connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            keys: RedisKeys::default(),
            scripts: Scripts::new(),
            _payload: PhantomData,
        }
    }

    /// Connect to `url`, e.g. `redis://127.0.0.1:6379/2`. The path selects
    /// the database.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::debug!("Connected to redis storage");
        Ok(Self::new(conn))
    }

    /// Use `<prefix>:pool`, `<prefix>:acquired` and `<prefix>:ids`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = RedisKeys::new(prefix);
        self
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Delete every trace of `ids` in one transaction.
    async fn purge(&self, ids: &[&str]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids {
            pipe.hdel(&self.keys.ids, *id)
                .ignore()
                .zrem(&self.keys.acquired, *id)
                .ignore()
                .lrem(&self.keys.pool, 0, *id)
                .ignore();
        }
        let mut conn = self.conn.clone();
        let (): () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Decode a record. One that does not decode can never be handed out or
    /// collected, so it is purged before the error is returned.
    async fn decode(&self, id: &str, json: &str) -> Result<Resource<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        match serde_json::from_str(json) {
            Ok(resource) => Ok(resource),
            Err(e) => {
                tracing::error!(resource = %id, error = %e, "Purging undecodable resource record");
                self.purge(&[id]).await?;
                Err(e.into())
            }
        }
    }

    /// Fetch and decode records for `ids`. Ids whose record is gone (removed
    /// concurrently) are skipped; records that cannot be decoded are purged.
    async fn load(&self, ids: &[String]) -> Result<Vec<Resource<T>>, StorageError>
    where
        T: DeserializeOwned,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.keys.ids)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        let mut resources = Vec::with_capacity(payloads.len());
        let mut undecodable = Vec::new();
        for (id, json) in ids.iter().zip(payloads) {
            let Some(json) = json else {
                continue;
            };
            match serde_json::from_str(&json) {
                Ok(resource) => resources.push(resource),
                Err(e) => {
                    tracing::error!(resource = %id, error = %e, "Purging undecodable resource record");
                    undecodable.push(id.as_str());
                }
            }
        }
        if let Err(e) = self.purge(&undecodable).await {
            tracing::warn!(count = undecodable.len(), error = %e, "Failed to purge undecodable records");
        }
        Ok(resources)
    }
}

#[async_trait]
impl<T> Storage<T> for RedisStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn is_empty(&self) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.keys.pool).await?;
        Ok(len == 0)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        let (available, acquired): (usize, usize) = redis::pipe()
            .atomic()
            .llen(&self.keys.pool)
            .zcard(&self.keys.acquired)
            .query_async(&mut conn)
            .await?;
        Ok(available + acquired)
    }

    async fn available_count(&self) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.keys.pool).await?;
        Ok(len)
    }

    async fn add(&self, resource: Resource<T>) -> Result<(), StorageError> {
        if resource.id.is_empty() {
            tracing::error!("Refusing to store resource without id");
            return Err(StorageError::InvalidResource);
        }
        let id = resource.id.as_str();
        let json = serde_json::to_string(&resource)?;

        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .hset(&self.keys.ids, id, json)
            .ignore()
            .zrem(&self.keys.acquired, id)
            .ignore()
            .lrem(&self.keys.pool, 0, id)
            .ignore()
            .rpush(&self.keys.pool, id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire(&self) -> Result<Option<Resource<T>>, StorageError> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = self
            .scripts
            .acquire
            .key(&self.keys.pool)
            .key(&self.keys.acquired)
            .key(&self.keys.ids)
            .arg(epoch_millis(now))
            .invoke_async(&mut conn)
            .await?;
        let Some((id, json)) = popped else {
            return Ok(None);
        };

        let mut resource = self.decode(&id, &json).await?;
        resource.last_acquired_at = Some(now);

        let stamped = serde_json::to_string(&resource)?;
        let _written: i64 = self
            .scripts
            .stamp_acquired
            .key(&self.keys.acquired)
            .key(&self.keys.ids)
            .arg(&id)
            .arg(stamped)
            .invoke_async(&mut conn)
            .await?;

        tracing::debug!(resource = %id, "Acquired from redis storage");
        Ok(Some(resource))
    }

    async fn release(&self, id: &ResourceId) -> Result<Option<ReleaseTiming>, StorageError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.hget(&self.keys.ids, id.as_str()).await?;
        let Some(json) = json else {
            tracing::debug!(resource = %id, "Release of unknown resource ignored");
            return Ok(None);
        };

        let released_at = Utc::now();
        let mut resource = self.decode(id.as_str(), &json).await?;
        resource.last_released_at = Some(released_at);
        let stamped = serde_json::to_string(&resource)?;

        let acquired_at: Option<i64> = self
            .scripts
            .release
            .key(&self.keys.pool)
            .key(&self.keys.acquired)
            .key(&self.keys.ids)
            .arg(id.as_str())
            .arg(stamped)
            .invoke_async(&mut conn)
            .await?;

        Ok(acquired_at.map(|ms| ReleaseTiming {
            acquired_at: from_epoch_millis(ms),
            released_at,
        }))
    }

    async fn remove(&self, id: &ResourceId) -> Result<(), StorageError> {
        self.purge(&[id.as_str()]).await
    }

    async fn get_all(&self, snapshot: Snapshot) -> Result<Vec<Resource<T>>, StorageError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.lrange(&self.keys.pool, 0, -1).await?;
        if snapshot == Snapshot::All {
            let acquired: Vec<String> = conn.zrange(&self.keys.acquired, 0, -1).await?;
            ids.extend(acquired);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        ids.retain(|id| seen.insert(id.clone()));
        self.load(&ids).await
    }

    async fn acquired_for(&self, held: Duration) -> Result<Vec<Resource<T>>, StorageError> {
        let max = epoch_millis(cutoff(held));
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(&self.keys.acquired, "-inf", max)
            .await?;
        self.load(&ids).await
    }

    async fn reset(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .del(&self.keys.pool)
            .ignore()
            .del(&self.keys.acquired)
            .ignore()
            .del(&self.keys.ids)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
