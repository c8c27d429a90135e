//! Per-call state and its durability boundary.
//!
//! [`ActiveCallState`] is the serializable part of a call: everything
//! the engine needs to resume after a restart. Timer handles and other
//! ephemeral companions never live here; they are reconstructed from
//! the snapshot when a call is rehydrated.
//!
//! [`CallStateStore`] keeps a typed local map of the calls this
//! instance owns and writes every snapshot through a [`CachedKvStore`]
//! to the shared TTL'd store. A snapshot missing locally but present in
//! the shared store is authoritative: that is what lets a second
//! instance (or a restarted one) pick up an in-flight call. A snapshot
//! marked handed off is never resurrected; it ages out on its TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use callflow_infra::kv::{self, CachedKvStore, KvStore};

use crate::types::{CallId, ChannelId, NodeId};

const SNAPSHOT_PREFIX: &str = "ivr:call:";
const ACTIVE_SET: &str = "ivr:calls";

/// Serializable progress of one live call through the IVR tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCallState {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    /// Entry key the dialplan selected the tree root with.
    pub entry_key: Option<String>,
    pub caller: Option<String>,
    /// Node currently owning the call, if any.
    pub current_node: Option<NodeId>,
    /// Whether a digit is currently expected.
    pub awaiting_digit: bool,
    /// Stack of visited node ids, for back-navigation.
    pub history: Vec<NodeId>,
    /// Handles of audio currently playing on this call.
    pub active_playbacks: HashSet<String>,
    /// A digit-wait timeout exists but is deferred until audio finishes.
    pub timeout_deferred: bool,
    /// Ownership has transferred to the queuing subsystem; the engine
    /// must not mutate this call again.
    pub handed_off: bool,
}

impl ActiveCallState {
    pub fn new(call_id: CallId, channel_id: ChannelId) -> Self {
        ActiveCallState {
            call_id,
            channel_id,
            entry_key: None,
            caller: None,
            current_node: None,
            awaiting_digit: false,
            history: Vec::new(),
            active_playbacks: HashSet::new(),
            timeout_deferred: false,
            handed_off: false,
        }
    }

    fn snapshot_key(call_id: &CallId) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, call_id)
    }
}

/// Call-state storage: the typed ownership map plus write-through
/// snapshots riding a read-through cache in front of the shared store.
pub struct CallStateStore {
    local: DashMap<CallId, ActiveCallState>,
    shared: CachedKvStore,
    snapshot_ttl: Duration,
}

impl CallStateStore {
    pub fn new(shared: Arc<dyn KvStore>, snapshot_ttl: Duration) -> Self {
        Self {
            local: DashMap::new(),
            shared: CachedKvStore::new(shared, Some(snapshot_ttl)),
            snapshot_ttl,
        }
    }

    /// Persist a snapshot locally and to the shared store.
    ///
    /// Shared-store failures are logged, not propagated: losing a
    /// snapshot write degrades restart recovery, it must not break a
    /// live call.
    pub async fn persist(&self, state: &ActiveCallState) {
        self.local.insert(state.call_id.clone(), state.clone());

        let key = ActiveCallState::snapshot_key(&state.call_id);
        if let Err(e) = kv::put_json(&self.shared, &key, state, Some(self.snapshot_ttl)).await {
            warn!("Failed to persist snapshot for call {}: {}", state.call_id, e);
            return;
        }
        if let Err(e) = self
            .shared
            .sadd(ACTIVE_SET, &state.call_id.0, Some(self.snapshot_ttl))
            .await
        {
            warn!("Failed to index call {}: {}", state.call_id, e);
        }
    }

    /// Fetch call state: the local map first, then the shared store.
    ///
    /// A shared-store hit is rehydrated into the local map so timers and
    /// other companions can be rebuilt by the caller.
    pub async fn get(&self, call_id: &CallId) -> Option<ActiveCallState> {
        if let Some(state) = self.local.get(call_id) {
            return Some(state.clone());
        }

        let key = ActiveCallState::snapshot_key(call_id);
        match kv::get_json::<ActiveCallState>(&self.shared, &key).await {
            Ok(Some(state)) => {
                debug!("Rehydrated call {} from shared store", call_id);
                self.local.insert(call_id.clone(), state.clone());
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read snapshot for call {}: {}", call_id, e);
                None
            }
        }
    }

    /// Whether this instance holds the call locally.
    pub fn contains(&self, call_id: &CallId) -> bool {
        self.local.contains_key(call_id)
    }

    /// Drop the local copy and unindex the call, but leave the shared
    /// snapshot to age out on its TTL. Used when ownership transfers
    /// elsewhere: a late rehydration finds the handed-off marker
    /// instead of a resurrectable call.
    pub async fn release(&self, call_id: &CallId) {
        self.local.remove(call_id);
        if let Err(e) = self.shared.srem(ACTIVE_SET, &call_id.0).await {
            warn!("Failed to unindex call {}: {}", call_id, e);
        }
    }

    /// Drop all state for a call. Idempotent.
    pub async fn remove(&self, call_id: &CallId) -> bool {
        let existed = self.local.remove(call_id).is_some();

        let key = ActiveCallState::snapshot_key(call_id);
        if let Err(e) = self.shared.delete(&key).await {
            warn!("Failed to delete snapshot for call {}: {}", call_id, e);
        }
        if let Err(e) = self.shared.srem(ACTIVE_SET, &call_id.0).await {
            warn!("Failed to unindex call {}: {}", call_id, e);
        }
        existed
    }

    /// Load every persisted snapshot into the local map; called on
    /// process start so in-flight calls are not silently dropped.
    /// Snapshots marked handed off belong to the queuing subsystem and
    /// are left alone.
    pub async fn load_persisted(&self) -> usize {
        let keys = match self.shared.keys(SNAPSHOT_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to enumerate persisted calls: {}", e);
                return 0;
            }
        };

        let mut loaded = 0;
        for key in keys {
            match kv::get_json::<ActiveCallState>(&self.shared, &key).await {
                Ok(Some(state)) if state.handed_off => {}
                Ok(Some(state)) => {
                    self.local.insert(state.call_id.clone(), state);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", key, e),
            }
        }

        if loaded > 0 {
            info!("Resumed {} in-flight calls from the shared store", loaded);
        }
        loaded
    }

    /// Number of calls in the local map.
    pub fn active_count(&self) -> usize {
        self.local.len()
    }

    /// Ids of all locally known calls.
    pub fn active_calls(&self) -> Vec<CallId> {
        self.local.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_infra::MemoryKvStore;

    fn sample_state(id: &str) -> ActiveCallState {
        let mut state = ActiveCallState::new(CallId::new(id), ChannelId::new(format!("ch-{}", id)));
        state.current_node = Some(NodeId::new("n-root"));
        state.awaiting_digit = true;
        state
    }

    #[tokio::test]
    async fn persist_and_rehydrate_through_shared_store() {
        let shared: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store_a = CallStateStore::new(shared.clone(), Duration::from_secs(60));
        store_a.persist(&sample_state("c1")).await;

        // A second instance sees the snapshot without any local state.
        let store_b = CallStateStore::new(shared.clone(), Duration::from_secs(60));
        let state = store_b.get(&CallId::new("c1")).await.unwrap();
        assert_eq!(state.current_node, Some(NodeId::new("n-root")));
        assert!(state.awaiting_digit);
    }

    #[tokio::test]
    async fn load_persisted_restores_all_calls() {
        let shared: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CallStateStore::new(shared.clone(), Duration::from_secs(60));
        store.persist(&sample_state("c1")).await;
        store.persist(&sample_state("c2")).await;

        let fresh = CallStateStore::new(shared, Duration::from_secs(60));
        assert_eq!(fresh.load_persisted().await, 2);
        assert_eq!(fresh.active_count(), 2);
    }

    #[tokio::test]
    async fn handed_off_snapshots_are_not_resumed() {
        let shared: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CallStateStore::new(shared.clone(), Duration::from_secs(60));
        let mut gone = sample_state("c1");
        gone.handed_off = true;
        store.persist(&gone).await;
        store.persist(&sample_state("c2")).await;

        let fresh = CallStateStore::new(shared, Duration::from_secs(60));
        assert_eq!(fresh.load_persisted().await, 1);
        assert!(fresh.contains(&CallId::new("c2")));
        assert!(!fresh.contains(&CallId::new("c1")));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let shared: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CallStateStore::new(shared.clone(), Duration::from_secs(60));
        store.persist(&sample_state("c1")).await;

        assert!(store.remove(&CallId::new("c1")).await);
        assert!(!store.remove(&CallId::new("c1")).await);
        assert!(store.get(&CallId::new("c1")).await.is_none());
        assert!(shared.smembers("ivr:calls").await.unwrap().is_empty());
    }
}
