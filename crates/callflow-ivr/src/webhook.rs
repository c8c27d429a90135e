//! Best-effort node-execution webhooks.
//!
//! Executing a node may notify an external system. Delivery is queued
//! through a channel consumed by one background task, so a slow
//! endpoint never stalls call handling; if the queue is gone the
//! notification falls back to a directly spawned call. Failures are
//! logged and dropped — a webhook can never affect a call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{CallId, NodeId};

/// Receives a notification each time a node executes.
#[async_trait]
pub trait NodeWebhook: Send + Sync {
    async fn notify(&self, call_id: &CallId, node_id: &NodeId, node_name: &str)
        -> anyhow::Result<()>;
}

/// Webhook that does nothing.
pub struct NoopWebhook;

#[async_trait]
impl NodeWebhook for NoopWebhook {
    async fn notify(
        &self,
        _call_id: &CallId,
        _node_id: &NodeId,
        _node_name: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Posts a JSON body to a fixed URL.
pub struct HttpWebhook {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NodeWebhook for HttpWebhook {
    async fn notify(
        &self,
        call_id: &CallId,
        node_id: &NodeId,
        node_name: &str,
    ) -> anyhow::Result<()> {
        let body = json!({
            "call_id": call_id.0,
            "node_id": node_id.0,
            "node_name": node_name,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

struct WebhookJob {
    call_id: CallId,
    node_id: NodeId,
    node_name: String,
}

/// Queued, best-effort webhook delivery.
#[derive(Clone)]
pub struct WebhookQueue {
    sink: Arc<dyn NodeWebhook>,
    tx: mpsc::UnboundedSender<WebhookJob>,
}

impl WebhookQueue {
    /// Create the queue and spawn its delivery task.
    pub fn start(sink: Arc<dyn NodeWebhook>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WebhookJob>();
        let worker_sink = sink.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = worker_sink
                    .notify(&job.call_id, &job.node_id, &job.node_name)
                    .await
                {
                    warn!(
                        "Webhook delivery failed for call {} node {}: {}",
                        job.call_id, job.node_id, e
                    );
                }
            }
            debug!("Webhook delivery task stopped");
        });
        Self { sink, tx }
    }

    /// Enqueue a notification; falls back to a direct spawned call if
    /// the delivery task is gone.
    pub fn enqueue(&self, call_id: &CallId, node_id: &NodeId, node_name: &str) {
        let job = WebhookJob {
            call_id: call_id.clone(),
            node_id: node_id.clone(),
            node_name: node_name.to_string(),
        };
        if let Err(returned) = self.tx.send(job) {
            let job = returned.0;
            let sink = self.sink.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.notify(&job.call_id, &job.node_id, &job.node_name).await {
                    warn!(
                        "Direct webhook delivery failed for call {}: {}",
                        job.call_id, e
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeWebhook for Recording {
        async fn notify(
            &self,
            call_id: &CallId,
            _node_id: &NodeId,
            node_name: &str,
        ) -> anyhow::Result<()> {
            self.seen.lock().push(format!("{}:{}", call_id, node_name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueued_notifications_are_delivered() {
        let sink = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let queue = WebhookQueue::start(sink.clone());

        queue.enqueue(&CallId::new("c1"), &NodeId::new("n1"), "root");
        queue.enqueue(&CallId::new("c1"), &NodeId::new("n2"), "hours");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = sink.seen.lock().clone();
        assert_eq!(seen, vec!["c1:root", "c1:hours"]);
    }
}
