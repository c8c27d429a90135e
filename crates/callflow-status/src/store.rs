//! Namespaced access to the status aggregates in the shared store.
//!
//! Key layout:
//! - `status:operator:<member_id>` + index set `status:operators`
//! - `status:channel:<name>`       + index set `status:channels`
//! - `status:queue:<queue>`        + index set `status:queues`
//!
//! All writes are TTL'd upserts; readers tolerate entries that expired
//! between the index lookup and the fetch.

use std::sync::Arc;
use std::time::Duration;

use callflow_infra::{get_json, put_json, KvStore};
use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::types::{ChannelStatus, OperatorStatus, QueueStatus};

const OPERATOR_PREFIX: &str = "status:operator:";
const OPERATOR_SET: &str = "status:operators";
const CHANNEL_PREFIX: &str = "status:channel:";
const CHANNEL_SET: &str = "status:channels";
const QUEUE_PREFIX: &str = "status:queue:";
const QUEUE_SET: &str = "status:queues";

/// Default TTL on status aggregates.
pub const STATUS_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(store, STATUS_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        StatusStore { store, ttl }
    }

    // === operators ========================================================

    pub async fn put_operator(&self, mut op: OperatorStatus) -> Result<()> {
        op.updated_at = Utc::now();
        let key = format!("{}{}", OPERATOR_PREFIX, op.member_id);
        put_json(self.store.as_ref(), &key, &op, Some(self.ttl)).await?;
        self.store
            .sadd(OPERATOR_SET, &op.member_id, Some(self.ttl))
            .await?;
        Ok(())
    }

    pub async fn operator(&self, member_id: &str) -> Result<Option<OperatorStatus>> {
        let key = format!("{}{}", OPERATOR_PREFIX, member_id);
        Ok(get_json(self.store.as_ref(), &key).await?)
    }

    pub async fn operators(&self) -> Result<Vec<OperatorStatus>> {
        let ids = self.store.smembers(OPERATOR_SET).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.operator(&id).await {
                Ok(Some(op)) => out.push(op),
                Ok(None) => {} // expired between index and fetch
                Err(e) => warn!("Operator {} unreadable: {}", id, e),
            }
        }
        Ok(out)
    }

    // === channels =========================================================

    pub async fn put_channel(&self, mut ch: ChannelStatus) -> Result<()> {
        ch.updated_at = Utc::now();
        let key = format!("{}{}", CHANNEL_PREFIX, ch.name);
        put_json(self.store.as_ref(), &key, &ch, Some(self.ttl)).await?;
        self.store.sadd(CHANNEL_SET, &ch.name, Some(self.ttl)).await?;
        Ok(())
    }

    pub async fn channel(&self, name: &str) -> Result<Option<ChannelStatus>> {
        let key = format!("{}{}", CHANNEL_PREFIX, name);
        Ok(get_json(self.store.as_ref(), &key).await?)
    }

    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        let key = format!("{}{}", CHANNEL_PREFIX, name);
        self.store.delete(&key).await?;
        self.store.srem(CHANNEL_SET, name).await?;
        Ok(())
    }

    pub async fn channels(&self) -> Result<Vec<ChannelStatus>> {
        let names = self.store.smembers(CHANNEL_SET).await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.channel(&name).await {
                Ok(Some(ch)) => out.push(ch),
                Ok(None) => {}
                Err(e) => warn!("Channel {} unreadable: {}", name, e),
            }
        }
        Ok(out)
    }

    // === queues ===========================================================

    pub async fn put_queue(&self, mut q: QueueStatus) -> Result<()> {
        q.updated_at = Utc::now();
        let key = format!("{}{}", QUEUE_PREFIX, q.name);
        put_json(self.store.as_ref(), &key, &q, Some(self.ttl)).await?;
        self.store.sadd(QUEUE_SET, &q.name, Some(self.ttl)).await?;
        Ok(())
    }

    pub async fn queue(&self, name: &str) -> Result<Option<QueueStatus>> {
        let key = format!("{}{}", QUEUE_PREFIX, name);
        Ok(get_json(self.store.as_ref(), &key).await?)
    }

    pub async fn queues(&self) -> Result<Vec<QueueStatus>> {
        let names = self.store.smembers(QUEUE_SET).await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.queue(&name).await {
                Ok(Some(q)) => out.push(q),
                Ok(None) => {}
                Err(e) => warn!("Queue {} unreadable: {}", name, e),
            }
        }
        Ok(out)
    }
}
