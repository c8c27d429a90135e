//! Shared, TTL'd key-value state.
//!
//! Call snapshots and status aggregates live under namespaced keys in a
//! store that outlives any single process, so a restarted (or second)
//! instance can pick up in-flight calls. Every write carries a TTL so
//! orphaned state from crashed calls self-expires instead of leaking.
//!
//! The [`KvStore`] trait is the durability boundary: business code never
//! touches a bare shared map. [`MemoryKvStore`] is the in-process
//! implementation used by tests and single-node deployments; an external
//! service is substituted at this seam without touching callers.
//! [`CachedKvStore`] adds the per-instance read-through cache: a local
//! miss falls through to the shared store, and the shared value wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::Result;

/// Abstract TTL'd key-value store with index-set support.
///
/// Values are stored as strings (callers serialize with
/// [`put_json`]/[`get_json`]). A `ttl` of `None` means the entry does
/// not expire.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Upsert a value. Last writer wins.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Read a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a value. Removing an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Add a member to an index set, refreshing the set's TTL.
    async fn sadd(&self, set: &str, member: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a member from an index set.
    async fn srem(&self, set: &str, member: &str) -> Result<()>;

    /// All members of an index set (empty if absent or expired).
    async fn smembers(&self, set: &str) -> Result<Vec<String>>;
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(key, raw, ttl).await
}

/// Read and deserialize a JSON value stored under `key`.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

impl SetEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

/// In-memory `KvStore` with lazy expiry.
///
/// Expired entries are dropped when read and by [`purge_expired`],
/// which long-running deployments call on a timer.
///
/// [`purge_expired`]: MemoryKvStore::purge_expired
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
    sets: DashMap<String, SetEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            sets: DashMap::new(),
        }
    }

    /// Drop every expired entry and set. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len() + self.sets.len();
        self.entries.retain(|_, e| e.live());
        self.sets.retain(|_, s| s.live());
        before - (self.entries.len() + self.sets.len())
    }

    /// Number of live value entries (test/diagnostic helper).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.live()).count()
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        trace!("kv put {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.live() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries are removed on the read path.
        self.entries.remove_if(key, |_, e| !e.live());
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.live() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn sadd(&self, set: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        let mut entry = self.sets.entry(set.to_string()).or_insert_with(|| SetEntry {
            members: HashSet::new(),
            expires_at,
        });
        if !entry.live() {
            entry.members.clear();
        }
        entry.members.insert(member.to_string());
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        if let Some(mut entry) = self.sets.get_mut(set) {
            entry.members.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        match self.sets.get(set) {
            Some(entry) if entry.live() => Ok(entry.members.iter().cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Read-through cache in front of a shared store.
///
/// Reads hit the local cache first; a miss falls through to the shared
/// store, whose value is authoritative and is cached locally. Writes go
/// to the shared store first so another instance never observes a value
/// this instance has not durably written.
pub struct CachedKvStore {
    shared: Arc<dyn KvStore>,
    cache: MemoryKvStore,
    cache_ttl: Option<Duration>,
}

impl CachedKvStore {
    pub fn new(shared: Arc<dyn KvStore>, cache_ttl: Option<Duration>) -> Self {
        Self {
            shared,
            cache: MemoryKvStore::new(),
            cache_ttl,
        }
    }
}

#[async_trait]
impl KvStore for CachedKvStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.shared.put(key, value.clone(), ttl).await?;
        self.cache.put(key, value, self.cache_ttl.or(ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(local) = self.cache.get(key).await? {
            return Ok(Some(local));
        }
        match self.shared.get(key).await? {
            Some(value) => {
                self.cache.put(key, value.clone(), self.cache_ttl).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.shared.delete(key).await?;
        self.cache.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        // Enumeration must see other instances' writes.
        self.shared.keys(prefix).await
    }

    async fn sadd(&self, set: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        self.shared.sadd(set, member, ttl).await
    }

    async fn srem(&self, set: &str, member: &str) -> Result<()> {
        self.shared.srem(set, member).await
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>> {
        self.shared.smembers(set).await
    }
}
