//! Call flow recorder: append-only per-call event log plus the derived
//! [`CallMeta`] summary.
//!
//! The log for a call is stored newest-first under `flow:log:<call_id>`
//! and the summary under `flow:meta:<call_id>`, both with a long TTL so
//! post-call auditing works without explicit deletion. Call end only
//! removes the id from the `flow:active` set; the records expire on
//! their own. A bounded in-process ring keeps the most recent events
//! across all calls for debugging.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callflow_infra::{get_json, put_json, KvStore};
use callflow_ivr::{sink, CallId, FlowSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{AgentLeg, CallFlowEvent, CallMeta, QueueVisit, StageVisit};

const LOG_PREFIX: &str = "flow:log:";
const META_PREFIX: &str = "flow:meta:";
const ACTIVE_SET: &str = "flow:active";

/// Default TTL on flow logs and call meta.
pub const FLOW_TTL: Duration = Duration::from_secs(24 * 3600);

const DEFAULT_AUDIT_CAPACITY: usize = 512;

pub struct CallFlowRecorder {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    audit: Mutex<VecDeque<CallFlowEvent>>,
    audit_capacity: usize,
}

impl CallFlowRecorder {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(store, FLOW_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        CallFlowRecorder {
            store,
            ttl,
            audit: Mutex::new(VecDeque::with_capacity(DEFAULT_AUDIT_CAPACITY)),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }

    // === event log ========================================================

    /// Append an event to its call's log (newest-first) and to the
    /// global audit ring, and mark the call active.
    pub async fn push_event(&self, event: CallFlowEvent) -> Result<()> {
        {
            let mut ring = self.audit.lock();
            if ring.len() == self.audit_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        let key = format!("{}{}", LOG_PREFIX, event.call_id);
        let mut log: Vec<CallFlowEvent> = get_json(self.store.as_ref(), &key)
            .await?
            .unwrap_or_default();
        log.insert(0, event.clone());
        put_json(self.store.as_ref(), &key, &log, Some(self.ttl)).await?;
        self.store
            .sadd(ACTIVE_SET, &event.call_id, Some(self.ttl))
            .await?;
        Ok(())
    }

    /// The call's log, newest event first.
    pub async fn call_log(&self, call_id: &str) -> Result<Vec<CallFlowEvent>> {
        let key = format!("{}{}", LOG_PREFIX, call_id);
        Ok(get_json(self.store.as_ref(), &key).await?.unwrap_or_default())
    }

    pub async fn call_meta(&self, call_id: &str) -> Result<Option<CallMeta>> {
        let key = format!("{}{}", META_PREFIX, call_id);
        Ok(get_json(self.store.as_ref(), &key).await?)
    }

    pub async fn active_calls(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(ACTIVE_SET).await?)
    }

    /// Most recent events across all calls, newest last.
    pub fn audit_tail(&self, limit: usize) -> Vec<CallFlowEvent> {
        let ring = self.audit.lock();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    // === meta patches =====================================================

    async fn patch_meta<F>(&self, call_id: &str, patch: F) -> Result<()>
    where
        F: FnOnce(&mut CallMeta),
    {
        let key = format!("{}{}", META_PREFIX, call_id);
        let mut meta: CallMeta = get_json(self.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| CallMeta::new(call_id));
        patch(&mut meta);
        meta.updated_at = Utc::now();
        put_json(self.store.as_ref(), &key, &meta, Some(self.ttl)).await?;
        Ok(())
    }

    pub async fn call_started(
        &self,
        call_id: &str,
        caller: Option<String>,
        callee: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.patch_meta(call_id, |meta| {
            meta.started_at.get_or_insert(at);
            if caller.is_some() {
                meta.caller = caller;
            }
            if callee.is_some() {
                meta.callee = callee;
            }
        })
        .await
    }

    /// Record entry into an IVR stage. Entering a new stage closes the
    /// previous open visit, back-filling its duration.
    pub async fn ivr_enter(&self, call_id: &str, stage: &str, at: DateTime<Utc>) -> Result<()> {
        self.patch_meta(call_id, |meta| {
            if let Some(open) = meta
                .ivr_visits
                .iter_mut()
                .rev()
                .find(|v| v.exited_at.is_none() && v.entered_at.is_some())
            {
                open.exited_at = Some(at);
                open.duration_ms = open
                    .entered_at
                    .map(|entered| (at - entered).num_milliseconds());
            }
            meta.ivr_visits.push(StageVisit {
                name: stage.to_string(),
                entered_at: Some(at),
                exited_at: None,
                duration_ms: None,
            });
        })
        .await
    }

    /// Record an explicit stage exit. Searches backward for the most
    /// recent unmatched opener for `stage`; without one the exit is
    /// appended standalone.
    pub async fn ivr_exit(&self, call_id: &str, stage: &str, at: DateTime<Utc>) -> Result<()> {
        let stage = stage.to_string();
        self.patch_meta(call_id, |meta| {
            match meta
                .ivr_visits
                .iter_mut()
                .rev()
                .find(|v| v.name == stage && v.exited_at.is_none() && v.entered_at.is_some())
            {
                Some(open) => {
                    open.exited_at = Some(at);
                    open.duration_ms = open
                        .entered_at
                        .map(|entered| (at - entered).num_milliseconds());
                }
                None => meta.ivr_visits.push(StageVisit {
                    name: stage.clone(),
                    entered_at: None,
                    exited_at: Some(at),
                    duration_ms: None,
                }),
            }
        })
        .await
    }

    /// Record entry into a queue. The same join can be reported twice,
    /// once by the IVR handoff and once by the management stream; an
    /// already-open visit for the queue absorbs the duplicate.
    pub async fn queue_join(&self, call_id: &str, queue: &str, at: DateTime<Utc>) -> Result<()> {
        let queue = queue.to_string();
        self.patch_meta(call_id, |meta| {
            if meta
                .queue_visits
                .iter()
                .any(|v| v.queue == queue && v.left_at.is_none() && v.joined_at.is_some())
            {
                return;
            }
            meta.queue_visits.push(QueueVisit {
                queue,
                joined_at: Some(at),
                left_at: None,
                wait_ms: None,
                leave_reason: None,
            });
        })
        .await
    }

    pub async fn queue_leave(
        &self,
        call_id: &str,
        queue: &str,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let queue = queue.to_string();
        self.patch_meta(call_id, |meta| {
            match meta
                .queue_visits
                .iter_mut()
                .rev()
                .find(|v| v.queue == queue && v.left_at.is_none() && v.joined_at.is_some())
            {
                Some(open) => {
                    open.left_at = Some(at);
                    open.wait_ms = open
                        .joined_at
                        .map(|joined| (at - joined).num_milliseconds());
                    open.leave_reason = reason;
                }
                None => meta.queue_visits.push(QueueVisit {
                    queue: queue.clone(),
                    joined_at: None,
                    left_at: Some(at),
                    wait_ms: None,
                    leave_reason: reason,
                }),
            }
        })
        .await
    }

    pub async fn agent_ring(&self, call_id: &str, member_id: &str, at: DateTime<Utc>) -> Result<()> {
        let member_id = member_id.to_string();
        self.patch_meta(call_id, |meta| {
            meta.agent_legs.push(AgentLeg {
                member_id,
                ring_at: Some(at),
                answered_at: None,
                hangup_at: None,
                ring_ms: None,
                talk_ms: None,
            });
        })
        .await
    }

    pub async fn agent_answer(
        &self,
        call_id: &str,
        member_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let member_id = member_id.to_string();
        self.patch_meta(call_id, |meta| {
            match meta
                .agent_legs
                .iter_mut()
                .rev()
                .find(|l| l.member_id == member_id && l.answered_at.is_none() && l.hangup_at.is_none())
            {
                Some(leg) => {
                    leg.answered_at = Some(at);
                    leg.ring_ms = leg.ring_at.map(|ring| (at - ring).num_milliseconds());
                }
                None => meta.agent_legs.push(AgentLeg {
                    member_id: member_id.clone(),
                    ring_at: None,
                    answered_at: Some(at),
                    hangup_at: None,
                    ring_ms: None,
                    talk_ms: None,
                }),
            }
        })
        .await
    }

    pub async fn agent_hangup(
        &self,
        call_id: &str,
        member_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let member_id = member_id.to_string();
        self.patch_meta(call_id, |meta| {
            match meta
                .agent_legs
                .iter_mut()
                .rev()
                .find(|l| l.member_id == member_id && l.hangup_at.is_none())
            {
                Some(leg) => {
                    leg.hangup_at = Some(at);
                    leg.talk_ms = leg
                        .answered_at
                        .map(|answered| (at - answered).num_milliseconds());
                }
                None => meta.agent_legs.push(AgentLeg {
                    member_id: member_id.clone(),
                    ring_at: None,
                    answered_at: None,
                    hangup_at: Some(at),
                    ring_ms: None,
                    talk_ms: None,
                }),
            }
        })
        .await
    }

    /// Mark the call ended and drop it from the active set. The log and
    /// meta stay behind until their TTL expires.
    pub async fn call_ended(
        &self,
        call_id: &str,
        cause: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.patch_meta(call_id, |meta| {
            meta.ended_at.get_or_insert(at);
            if meta.end_cause.is_none() {
                meta.end_cause = cause;
            }
            // Close any still-open IVR visit.
            if let Some(open) = meta
                .ivr_visits
                .iter_mut()
                .rev()
                .find(|v| v.exited_at.is_none() && v.entered_at.is_some())
            {
                open.exited_at = Some(at);
                open.duration_ms = open
                    .entered_at
                    .map(|entered| (at - entered).num_milliseconds());
            }
        })
        .await?;
        self.store.srem(ACTIVE_SET, call_id).await?;
        Ok(())
    }
}

/// The engine's flow events feed the recorder directly: node executions
/// become IVR stage visits, queue handoffs open queue visits, call end
/// closes the record. Recording is best-effort; failures are logged and
/// never surface to the engine.
#[async_trait]
impl FlowSink for CallFlowRecorder {
    async fn record(&self, call_id: &CallId, event: &str, detail: serde_json::Value) {
        let now = Utc::now();
        let flow_event = CallFlowEvent {
            time: now,
            event: event.to_string(),
            channel_id: None,
            call_id: call_id.0.clone(),
            payload: detail.clone(),
        };
        if let Err(e) = self.push_event(flow_event).await {
            warn!("Flow log append failed for call {}: {}", call_id, e);
            return;
        }

        let result = match event {
            sink::NODE_EXECUTE => match detail.get("name").and_then(|v| v.as_str()) {
                Some(name) => self.ivr_enter(&call_id.0, name, now).await,
                None => Ok(()),
            },
            sink::QUEUE_HANDOFF => match detail.get("queue").and_then(|v| v.as_str()) {
                Some(queue) => self.queue_join(&call_id.0, queue, now).await,
                None => Ok(()),
            },
            sink::CALL_END => {
                let cause = detail
                    .get("cause")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                self.call_ended(&call_id.0, cause, now).await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Call meta patch failed for call {}: {}", call_id, e);
        } else {
            debug!("Recorded {} for call {}", event, call_id);
        }
    }
}
