//! Read surface over the status aggregates and call-flow records,
//! consumed by HTTP controllers that live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::recorder::CallFlowRecorder;
use crate::store::StatusStore;
use crate::types::{
    CallFlowEvent, CallMeta, ChannelStatus, DashboardSnapshot, OperatorStatus, QueueStatus,
};

/// An operator as defined in the definitional store (roster), before
/// any live status is known.
#[derive(Debug, Clone)]
pub struct RosterOperator {
    pub member_id: String,
    pub name: String,
    pub queue: Option<String>,
    /// Endpoint interface name used for channel correlation.
    pub interface: Option<String>,
}

/// Source of truth for which operators and queues exist.
#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn operators(&self) -> Result<Vec<RosterOperator>>;
    async fn queues(&self) -> Result<Vec<String>>;
}

pub struct QueryService {
    status: StatusStore,
    recorder: Arc<CallFlowRecorder>,
}

impl QueryService {
    pub fn new(status: StatusStore, recorder: Arc<CallFlowRecorder>) -> Self {
        QueryService { status, recorder }
    }

    pub async fn operator(&self, member_id: &str) -> Result<Option<OperatorStatus>> {
        self.status.operator(member_id).await
    }

    pub async fn operators(&self) -> Result<Vec<OperatorStatus>> {
        self.status.operators().await
    }

    pub async fn channel(&self, name: &str) -> Result<Option<ChannelStatus>> {
        self.status.channel(name).await
    }

    pub async fn channels(&self) -> Result<Vec<ChannelStatus>> {
        self.status.channels().await
    }

    pub async fn queue(&self, name: &str) -> Result<Option<QueueStatus>> {
        self.status.queue(name).await
    }

    pub async fn queues(&self) -> Result<Vec<QueueStatus>> {
        self.status.queues().await
    }

    pub async fn call_log(&self, call_id: &str) -> Result<Vec<CallFlowEvent>> {
        self.recorder.call_log(call_id).await
    }

    pub async fn call_meta(&self, call_id: &str) -> Result<Option<CallMeta>> {
        self.recorder.call_meta(call_id).await
    }

    /// Everything at once, for the dashboard.
    pub async fn dashboard(&self) -> Result<DashboardSnapshot> {
        Ok(DashboardSnapshot {
            operators: self.status.operators().await?,
            channels: self.status.channels().await?,
            queues: self.status.queues().await?,
            active_calls: self.recorder.active_calls().await?,
            taken_at: Utc::now(),
        })
    }

    /// Rebuild the aggregate baseline from the definitional store.
    ///
    /// Every roster operator gets a record (existing live status is
    /// kept, new ones start offline) and every queue gets a counter
    /// record, so enumeration works before any event has arrived.
    pub async fn resync(&self, roster: &dyn RosterProvider) -> Result<usize> {
        let mut written = 0;

        for entry in roster.operators().await? {
            let mut op = self
                .status
                .operator(&entry.member_id)
                .await?
                .unwrap_or_else(|| OperatorStatus::new(&entry.member_id, &entry.name));
            op.name = entry.name;
            if entry.queue.is_some() {
                op.queue = entry.queue;
            }
            if entry.interface.is_some() {
                op.interface = entry.interface;
            }
            self.status.put_operator(op).await?;
            written += 1;
        }

        for name in roster.queues().await? {
            let q = self
                .status
                .queue(&name)
                .await?
                .unwrap_or_else(|| QueueStatus::new(&name));
            self.status.put_queue(q).await?;
            written += 1;
        }

        info!("Status resync wrote {} records", written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperatorState;
    use callflow_infra::{KvStore, MemoryKvStore};

    struct FixedRoster;

    #[async_trait]
    impl RosterProvider for FixedRoster {
        async fn operators(&self) -> Result<Vec<RosterOperator>> {
            Ok(vec![
                RosterOperator {
                    member_id: "op1".to_string(),
                    name: "Alice".to_string(),
                    queue: Some("support".to_string()),
                    interface: Some("PJSIP/op1".to_string()),
                },
                RosterOperator {
                    member_id: "op2".to_string(),
                    name: "Bob".to_string(),
                    queue: Some("sales".to_string()),
                    interface: None,
                },
            ])
        }

        async fn queues(&self) -> Result<Vec<String>> {
            Ok(vec!["support".to_string(), "sales".to_string()])
        }
    }

    #[tokio::test]
    async fn resync_seeds_the_baseline() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let service = QueryService::new(
            StatusStore::new(kv.clone()),
            Arc::new(CallFlowRecorder::new(kv)),
        );

        let written = service.resync(&FixedRoster).await.unwrap();
        assert_eq!(written, 4);

        let op = service.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.name, "Alice");
        assert_eq!(op.state, OperatorState::Offline);
        assert_eq!(op.interface.as_deref(), Some("PJSIP/op1"));
        assert_eq!(service.queues().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn resync_keeps_live_status() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let status = StatusStore::new(kv.clone());
        let service = QueryService::new(status.clone(), Arc::new(CallFlowRecorder::new(kv)));

        let mut live = OperatorStatus::new("op1", "Alice");
        live.state = OperatorState::InCall;
        status.put_operator(live).await.unwrap();

        service.resync(&FixedRoster).await.unwrap();
        let op = service.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::InCall);
    }

    #[tokio::test]
    async fn dashboard_collects_every_aggregate() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let status = StatusStore::new(kv.clone());
        let service = QueryService::new(status.clone(), Arc::new(CallFlowRecorder::new(kv)));
        service.resync(&FixedRoster).await.unwrap();

        let snapshot = service.dashboard().await.unwrap();
        assert_eq!(snapshot.operators.len(), 2);
        assert_eq!(snapshot.queues.len(), 2);
        assert!(snapshot.channels.is_empty());
        assert!(snapshot.active_calls.is_empty());
    }
}
