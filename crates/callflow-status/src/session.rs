//! Management-session action interface.
//!
//! Sending an action to the PBX triggers a burst of correlated response
//! events terminated by a sentinel `ActionComplete`. The caller collects
//! them with [`collect_action_response`], which stops at the sentinel or
//! at the deadline, whichever comes first.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Result, StatusError};
use crate::events::ManagementEvent;

#[async_trait]
pub trait ManagementSession: Send + Sync {
    /// Send an action; its correlated response events arrive on the
    /// returned receiver, terminated by [`ManagementEvent::ActionComplete`].
    async fn send_action(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<mpsc::Receiver<ManagementEvent>>;
}

/// Collect the response burst of one action.
///
/// Returns everything received before the sentinel. Hitting the timeout
/// or a closed channel first is not an error; whatever arrived is
/// returned and a warning is logged for the timeout case.
pub async fn collect_action_response(
    session: &dyn ManagementSession,
    name: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> Result<Vec<ManagementEvent>> {
    let mut rx = session
        .send_action(name, params)
        .await
        .map_err(|e| StatusError::session(format!("send {} failed: {}", name, e)))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(ManagementEvent::ActionComplete)) => break,
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Action {} response incomplete after {:?} ({} events collected)",
                    name,
                    timeout,
                    events.len()
                );
                break;
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a scripted burst for every action.
    struct ScriptedSession {
        burst: Vec<ManagementEvent>,
    }

    #[async_trait]
    impl ManagementSession for ScriptedSession {
        async fn send_action(
            &self,
            _name: &str,
            _params: serde_json::Value,
        ) -> Result<mpsc::Receiver<ManagementEvent>> {
            let (tx, rx) = mpsc::channel(16);
            let burst = self.burst.clone();
            tokio::spawn(async move {
                for event in burst {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn join(queue: &str) -> ManagementEvent {
        ManagementEvent::QueueCallerJoin {
            queue: queue.to_string(),
            call_id: None,
        }
    }

    #[tokio::test]
    async fn collects_until_the_sentinel() {
        let session = ScriptedSession {
            burst: vec![
                join("a"),
                join("b"),
                ManagementEvent::ActionComplete,
                join("after-sentinel"),
            ],
        };
        let events = collect_action_response(
            &session,
            "QueueStatus",
            serde_json::json!({}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn timeout_returns_what_arrived() {
        // One event, no sentinel, and the sender stays open past the
        // deadline.
        struct StallingSession;
        #[async_trait]
        impl ManagementSession for StallingSession {
            async fn send_action(
                &self,
                _name: &str,
                _params: serde_json::Value,
            ) -> Result<mpsc::Receiver<ManagementEvent>> {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    let _ = tx
                        .send(ManagementEvent::QueueCallerJoin {
                            queue: "a".to_string(),
                            call_id: None,
                        })
                        .await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    drop(tx);
                });
                Ok(rx)
            }
        }

        let events = collect_action_response(
            &StallingSession,
            "QueueStatus",
            serde_json::json!({}),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
    }
}
