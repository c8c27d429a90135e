//! Event reconciler: turns the management-event stream into consistent
//! operator, channel, and queue aggregates.
//!
//! Each event variant has one handler; a handler failure is logged with
//! the event name and skipped, never halting processing of subsequent
//! events. All writes are TTL'd upserts through [`StatusStore`], so a
//! crashed or silent source lets stale entries age out on their own.
//!
//! The telephony layer and the operator roster only share loosely
//! correlated identifiers (interface name vs. instantiated channel
//! name), which is why channel-up and hangup both scan the roster with
//! a set of matching heuristics instead of a single key lookup.

use std::sync::Arc;

use callflow_infra::EventBus;
use callflow_ivr::ChannelState;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::ManagementEvent;
use crate::recorder::CallFlowRecorder;
use crate::store::StatusStore;
use crate::types::{ChannelStatus, OperatorState, OperatorStatus, QueueStatus};

pub struct StatusReconciler {
    status: StatusStore,
    recorder: Option<Arc<CallFlowRecorder>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StatusReconciler {
    pub fn new(status: StatusStore) -> Self {
        StatusReconciler {
            status,
            recorder: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a recorder so queue and agent events also patch call meta.
    pub fn with_recorder(mut self, recorder: Arc<CallFlowRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Subscribe to the management-event bus and reconcile every event
    /// until the bus closes.
    pub fn start(self: &Arc<Self>, bus: &EventBus<ManagementEvent>) {
        let mut events = bus.subscribe();
        let reconciler = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => reconciler.apply(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Reconciler lagged behind the event bus by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().push(task);
        info!("Status reconciler started");
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Reconcile one event. A failure is logged and skipped; the next
    /// event is always processed.
    pub async fn apply(&self, event: ManagementEvent) {
        let name = event.name();
        if let Err(e) = self.try_apply(event).await {
            warn!("Reconciliation of {} failed: {}", name, e);
        }
    }

    async fn try_apply(&self, event: ManagementEvent) -> Result<()> {
        match event {
            ManagementEvent::MemberStatus {
                member_id,
                name,
                queue,
                paused,
                pause_reason,
                in_call,
            } => {
                self.on_member_status(member_id, name, queue, paused, pause_reason, in_call)
                    .await
            }
            ManagementEvent::AgentLogin {
                member_id,
                name,
                queue,
            } => self.on_agent_login(member_id, name, queue).await,
            ManagementEvent::AgentLogoff { member_id } => self.on_agent_logoff(member_id).await,
            ManagementEvent::ChannelUpdate {
                unique_id,
                name,
                state,
                extension,
                context,
            } => {
                self.on_channel_update(unique_id, name, state, extension, context)
                    .await
            }
            ManagementEvent::BridgeEnter {
                channel_name,
                unique_id,
                legacy_call_id,
            } => {
                self.mark_operator_in_call(
                    &channel_name,
                    unique_id.as_deref(),
                    legacy_call_id.as_deref(),
                )
                .await
            }
            ManagementEvent::Hangup {
                channel_name,
                unique_id,
                legacy_call_id,
                cause: _,
            } => {
                self.on_hangup(channel_name, unique_id, legacy_call_id)
                    .await
            }
            ManagementEvent::PeerStatus {
                member_id,
                reachable,
            } => self.on_peer_status(member_id, reachable).await,
            ManagementEvent::QueueMemberPaused {
                member_id,
                queue,
                paused,
                reason,
            } => {
                self.on_queue_member_paused(member_id, queue, paused, reason)
                    .await
            }
            ManagementEvent::QueueCallerJoin { queue, call_id } => {
                self.on_queue_caller_join(queue, call_id).await
            }
            ManagementEvent::QueueCallerLeave {
                queue,
                call_id,
                wait_secs,
                reason,
            } => {
                self.on_queue_caller_leave(queue, call_id, wait_secs, reason)
                    .await
            }
            ManagementEvent::AgentRing {
                member_id,
                queue: _,
                call_id,
            } => {
                if let (Some(rec), Some(call)) = (&self.recorder, &call_id) {
                    rec.agent_ring(call, &member_id, Utc::now()).await?;
                }
                Ok(())
            }
            ManagementEvent::AgentAnswer { member_id, call_id } => {
                self.on_agent_answer(member_id, call_id).await
            }
            ManagementEvent::AgentHangup { member_id, call_id } => {
                self.on_agent_hangup(member_id, call_id).await
            }
            // Sentinel for action-response collection, nothing to apply.
            ManagementEvent::ActionComplete => Ok(()),
        }
    }

    // === operators ========================================================

    async fn on_member_status(
        &self,
        member_id: String,
        name: String,
        queue: Option<String>,
        paused: bool,
        pause_reason: Option<String>,
        in_call: bool,
    ) -> Result<()> {
        let mut op = self
            .status
            .operator(&member_id)
            .await?
            .unwrap_or_else(|| OperatorStatus::new(&member_id, &name));
        op.name = name;
        if queue.is_some() {
            op.queue = queue;
        }
        op.paused = paused;
        op.pause_reason = pause_reason;
        // Precedence: paused beats in-call beats idle. Unknown or
        // legacy status codes never reach here;
        // ManagementEvent::member_status_from_wire decodes them as
        // plain idle reports.
        op.state = if paused {
            OperatorState::Paused
        } else if in_call {
            OperatorState::InCall
        } else {
            OperatorState::Idle
        };
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    async fn on_agent_login(
        &self,
        member_id: String,
        name: String,
        queue: Option<String>,
    ) -> Result<()> {
        let mut op = self
            .status
            .operator(&member_id)
            .await?
            .unwrap_or_else(|| OperatorStatus::new(&member_id, &name));
        op.name = name;
        if queue.is_some() {
            op.queue = queue;
        }
        op.logged_in_at = Some(Utc::now());
        op.logged_out_at = None;
        op.state = op.resting_state();
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    async fn on_agent_logoff(&self, member_id: String) -> Result<()> {
        let Some(mut op) = self.status.operator(&member_id).await? else {
            debug!("Logoff for unknown operator {} ignored", member_id);
            return Ok(());
        };
        op.state = OperatorState::Offline;
        op.logged_out_at = Some(Utc::now());
        op.clear_call();
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    async fn on_queue_member_paused(
        &self,
        member_id: String,
        queue: Option<String>,
        paused: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let Some(mut op) = self.status.operator(&member_id).await? else {
            debug!("Pause toggle for unknown operator {} ignored", member_id);
            return Ok(());
        };
        if queue.is_some() {
            op.queue = queue;
        }
        op.paused = paused;
        op.pause_reason = if paused { reason } else { None };
        // An in-call operator keeps its call; the pause only shows once
        // the call ends, through resting_state.
        if op.state != OperatorState::InCall && op.state != OperatorState::Offline {
            op.state = op.resting_state();
        }
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    async fn on_peer_status(&self, member_id: String, reachable: bool) -> Result<()> {
        let Some(mut op) = self.status.operator(&member_id).await? else {
            debug!("Peer status for unknown operator {} ignored", member_id);
            return Ok(());
        };
        if reachable {
            // Restore to idle or paused, never into in-call.
            if op.state == OperatorState::Offline {
                op.state = op.resting_state();
            }
        } else {
            op.state = OperatorState::Offline;
            op.clear_call();
        }
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    // === channels =========================================================

    async fn on_channel_update(
        &self,
        unique_id: Option<String>,
        name: String,
        state: ChannelState,
        extension: Option<String>,
        context: Option<String>,
    ) -> Result<()> {
        let prior = self.status.channel(&name).await?;
        let newly_up = state == ChannelState::Up
            && prior.map(|c| c.state != ChannelState::Up).unwrap_or(true);

        self.status
            .put_channel(ChannelStatus {
                id: unique_id.clone(),
                name: name.clone(),
                state,
                extension,
                context,
                updated_at: Utc::now(),
            })
            .await?;

        if newly_up {
            self.mark_operator_in_call(&name, unique_id.as_deref(), None)
                .await?;
        }
        Ok(())
    }

    async fn on_hangup(
        &self,
        channel_name: String,
        unique_id: Option<String>,
        legacy_call_id: Option<String>,
    ) -> Result<()> {
        self.status.remove_channel(&channel_name).await?;

        // Symmetric scan-and-clear: any operator still pointing at this
        // channel returns to rest, with the paused flag preserved.
        for mut op in self.status.operators().await? {
            let matched = op.channel.as_deref() == Some(channel_name.as_str())
                || (unique_id.is_some() && op.call_id == unique_id)
                || (legacy_call_id.is_some() && op.legacy_call_id == legacy_call_id);
            if !matched {
                continue;
            }
            op.state = op.resting_state();
            op.clear_call();
            let affected = op.queue.clone();
            self.status.put_operator(op).await?;
            if let Some(q) = affected {
                self.recompute_queue(&q).await?;
            }
        }
        Ok(())
    }

    /// Best-effort scan of the roster when a channel reaches the up
    /// state: the operator this channel belongs to goes in-call.
    ///
    /// Prefix matches are inherently ambiguous (`PJSIP/op1` matches
    /// both `PJSIP/op1-000001` and `PJSIP/op11-000002` instances), so
    /// candidates are ordered deterministically: most recently updated
    /// first, then lexical member id.
    async fn mark_operator_in_call(
        &self,
        channel_name: &str,
        unique_id: Option<&str>,
        legacy_call_id: Option<&str>,
    ) -> Result<()> {
        let mut candidates: Vec<OperatorStatus> = self
            .status
            .operators()
            .await?
            .into_iter()
            .filter(|op| op.state != OperatorState::InCall)
            .filter(|op| operator_matches_channel(op, channel_name, legacy_call_id))
            .collect();
        if candidates.is_empty() {
            debug!("No operator matched channel {}", channel_name);
            return Ok(());
        }
        candidates.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.member_id.cmp(&b.member_id))
        });

        let mut op = candidates.remove(0);
        op.state = OperatorState::InCall;
        op.channel = Some(channel_name.to_string());
        if unique_id.is_some() {
            op.call_id = unique_id.map(String::from);
        }
        if legacy_call_id.is_some() {
            op.legacy_call_id = legacy_call_id.map(String::from);
        }
        info!(
            "Operator {} marked in-call on channel {}",
            op.member_id, channel_name
        );
        let affected = op.queue.clone();
        self.status.put_operator(op).await?;
        if let Some(q) = affected {
            self.recompute_queue(&q).await?;
        }
        Ok(())
    }

    // === queues ===========================================================

    async fn on_queue_caller_join(&self, queue: String, call_id: Option<String>) -> Result<()> {
        let mut q = self
            .status
            .queue(&queue)
            .await?
            .unwrap_or_else(|| QueueStatus::new(&queue));
        q.calls_waiting += 1;
        self.status.put_queue(q).await?;

        if let (Some(rec), Some(call)) = (&self.recorder, &call_id) {
            rec.queue_join(call, &queue, Utc::now()).await?;
        }
        Ok(())
    }

    async fn on_queue_caller_leave(
        &self,
        queue: String,
        call_id: Option<String>,
        wait_secs: Option<u64>,
        reason: Option<String>,
    ) -> Result<()> {
        let mut q = self
            .status
            .queue(&queue)
            .await?
            .unwrap_or_else(|| QueueStatus::new(&queue));
        q.calls_waiting = q.calls_waiting.saturating_sub(1);
        if let Some(wait) = wait_secs {
            q.longest_wait_secs = q.longest_wait_secs.max(wait);
        }
        self.status.put_queue(q).await?;

        if let (Some(rec), Some(call)) = (&self.recorder, &call_id) {
            rec.queue_leave(call, &queue, reason, Utc::now()).await?;
        }
        Ok(())
    }

    async fn on_agent_answer(&self, member_id: String, call_id: Option<String>) -> Result<()> {
        if let Some(mut op) = self.status.operator(&member_id).await? {
            op.state = OperatorState::InCall;
            if call_id.is_some() {
                op.call_id = call_id.clone();
            }
            let affected = op.queue.clone();
            self.status.put_operator(op).await?;
            if let Some(q) = affected {
                self.recompute_queue(&q).await?;
            }
        }
        if let (Some(rec), Some(call)) = (&self.recorder, &call_id) {
            rec.agent_answer(call, &member_id, Utc::now()).await?;
        }
        Ok(())
    }

    async fn on_agent_hangup(&self, member_id: String, call_id: Option<String>) -> Result<()> {
        if let Some(mut op) = self.status.operator(&member_id).await? {
            op.state = op.resting_state();
            op.clear_call();
            let affected = op.queue.clone();
            self.status.put_operator(op).await?;
            if let Some(q) = affected {
                self.recompute_queue(&q).await?;
            }
        }
        if let (Some(rec), Some(call)) = (&self.recorder, &call_id) {
            rec.agent_hangup(call, &member_id, Utc::now()).await?;
        }
        Ok(())
    }

    /// Recompute coarse member counters for a queue from the operator
    /// records; caller counts are maintained by delta.
    async fn recompute_queue(&self, queue: &str) -> Result<()> {
        let operators = self.status.operators().await?;
        let mut q = self
            .status
            .queue(queue)
            .await?
            .unwrap_or_else(|| QueueStatus::new(queue));
        let serving: Vec<&OperatorStatus> = operators
            .iter()
            .filter(|op| op.queue.as_deref() == Some(queue))
            .collect();
        q.members = serving
            .iter()
            .filter(|op| op.state != OperatorState::Offline)
            .count() as u32;
        q.active_members = serving
            .iter()
            .filter(|op| op.state == OperatorState::InCall)
            .count() as u32;
        self.status.put_queue(q).await?;
        Ok(())
    }
}

fn operator_matches_channel(
    op: &OperatorStatus,
    channel_name: &str,
    legacy_call_id: Option<&str>,
) -> bool {
    if let Some(interface) = &op.interface {
        // Interface equality or instantiated-channel prefix
        // (`PJSIP/op1` vs `PJSIP/op1-000001`).
        if channel_name == interface || channel_name.starts_with(&format!("{}-", interface)) {
            return true;
        }
    }
    if op.channel.as_deref() == Some(channel_name) {
        return true;
    }
    if legacy_call_id.is_some() && op.legacy_call_id.as_deref() == legacy_call_id {
        return true;
    }
    // Member-id correspondence against the channel's local part.
    channel_local_part(channel_name)
        .map(|local| local.starts_with(&op.member_id))
        .unwrap_or(false)
}

/// `PJSIP/op1-000001` -> `op1-000001`.
fn channel_local_part(channel_name: &str) -> Option<&str> {
    channel_name.split_once('/').map(|(_, local)| local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_infra::MemoryKvStore;

    fn reconciler() -> (StatusReconciler, StatusStore) {
        let store: Arc<dyn callflow_infra::KvStore> = Arc::new(MemoryKvStore::new());
        let status = StatusStore::new(store);
        (StatusReconciler::new(status.clone()), status)
    }

    fn member_status(member_id: &str, paused: bool, in_call: bool) -> ManagementEvent {
        ManagementEvent::MemberStatus {
            member_id: member_id.to_string(),
            name: member_id.to_string(),
            queue: Some("support".to_string()),
            paused,
            pause_reason: paused.then(|| "lunch".to_string()),
            in_call,
        }
    }

    #[tokio::test]
    async fn paused_takes_precedence_over_in_call() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", true, true)).await;

        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Paused);
        assert!(op.paused);
        assert_eq!(op.pause_reason.as_deref(), Some("lunch"));
    }

    #[tokio::test]
    async fn wire_member_status_reconciles_to_in_call() {
        let (rec, status) = reconciler();
        // The raw frame shape off the management stream.
        rec.apply(ManagementEvent::member_status_from_wire(
            "op1",
            "op1",
            Some("support".to_string()),
            "1",
            "0",
            "1",
        ))
        .await;

        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::InCall);

        // An unrecognized device code falls back to idle.
        rec.apply(ManagementEvent::member_status_from_wire(
            "op1",
            "op1",
            None,
            "42",
            "",
            "",
        ))
        .await;
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Idle);
    }

    #[tokio::test]
    async fn channel_up_flips_the_prefix_matched_operator() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", false, false)).await;
        let mut op = status.operator("op1").await.unwrap().unwrap();
        op.interface = Some("PJSIP/op1".to_string());
        status.put_operator(op).await.unwrap();

        rec.apply(ManagementEvent::BridgeEnter {
            channel_name: "PJSIP/op1-000004".to_string(),
            unique_id: Some("uid-1".to_string()),
            legacy_call_id: None,
        })
        .await;

        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::InCall);
        assert_eq!(op.channel.as_deref(), Some("PJSIP/op1-000004"));
        assert_eq!(op.call_id.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn ambiguous_prefix_match_prefers_most_recently_updated() {
        let (rec, status) = reconciler();
        // Two operators whose member ids both prefix the channel's
        // local part.
        rec.apply(member_status("op", false, false)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        rec.apply(member_status("op1", false, false)).await;

        rec.apply(ManagementEvent::BridgeEnter {
            channel_name: "PJSIP/op1-000001".to_string(),
            unique_id: None,
            legacy_call_id: None,
        })
        .await;

        // "op1" was written last, so it wins the tie.
        let winner = status.operator("op1").await.unwrap().unwrap();
        let loser = status.operator("op").await.unwrap().unwrap();
        assert_eq!(winner.state, OperatorState::InCall);
        assert_eq!(loser.state, OperatorState::Idle);
    }

    #[tokio::test]
    async fn hangup_clears_channel_and_resets_operator_preserving_pause() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", true, false)).await;
        let mut op = status.operator("op1").await.unwrap().unwrap();
        op.interface = Some("PJSIP/op1".to_string());
        status.put_operator(op).await.unwrap();

        rec.apply(ManagementEvent::ChannelUpdate {
            unique_id: Some("uid-2".to_string()),
            name: "PJSIP/op1-000007".to_string(),
            state: ChannelState::Up,
            extension: None,
            context: None,
        })
        .await;
        assert_eq!(
            status.operator("op1").await.unwrap().unwrap().state,
            OperatorState::InCall
        );
        assert!(status.channel("PJSIP/op1-000007").await.unwrap().is_some());

        rec.apply(ManagementEvent::Hangup {
            channel_name: "PJSIP/op1-000007".to_string(),
            unique_id: Some("uid-2".to_string()),
            legacy_call_id: None,
            cause: Some("normal".to_string()),
        })
        .await;

        assert!(status.channel("PJSIP/op1-000007").await.unwrap().is_none());
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Paused);
        assert!(op.call_id.is_none());
        assert!(op.channel.is_none());
    }

    #[tokio::test]
    async fn peer_status_transitions() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", false, true)).await;

        rec.apply(ManagementEvent::PeerStatus {
            member_id: "op1".to_string(),
            reachable: false,
        })
        .await;
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Offline);
        assert!(op.call_id.is_none());

        // Coming back never lands in in-call.
        rec.apply(ManagementEvent::PeerStatus {
            member_id: "op1".to_string(),
            reachable: true,
        })
        .await;
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Idle);
    }

    #[tokio::test]
    async fn pause_toggle_waits_for_the_call_to_end() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", false, true)).await;

        rec.apply(ManagementEvent::QueueMemberPaused {
            member_id: "op1".to_string(),
            queue: None,
            paused: true,
            reason: Some("wrap-up".to_string()),
        })
        .await;
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::InCall);
        assert!(op.paused);

        rec.apply(ManagementEvent::AgentHangup {
            member_id: "op1".to_string(),
            call_id: None,
        })
        .await;
        let op = status.operator("op1").await.unwrap().unwrap();
        assert_eq!(op.state, OperatorState::Paused);
        assert_eq!(op.pause_reason.as_deref(), Some("wrap-up"));
    }

    #[tokio::test]
    async fn queue_caller_counters() {
        let (rec, status) = reconciler();
        rec.apply(ManagementEvent::QueueCallerJoin {
            queue: "support".to_string(),
            call_id: None,
        })
        .await;
        rec.apply(ManagementEvent::QueueCallerJoin {
            queue: "support".to_string(),
            call_id: None,
        })
        .await;
        rec.apply(ManagementEvent::QueueCallerLeave {
            queue: "support".to_string(),
            call_id: None,
            wait_secs: Some(42),
            reason: Some("answered".to_string()),
        })
        .await;

        let q = status.queue("support").await.unwrap().unwrap();
        assert_eq!(q.calls_waiting, 1);
        assert_eq!(q.longest_wait_secs, 42);

        // Leaving an empty queue never underflows.
        rec.apply(ManagementEvent::QueueCallerLeave {
            queue: "support".to_string(),
            call_id: None,
            wait_secs: None,
            reason: None,
        })
        .await;
        rec.apply(ManagementEvent::QueueCallerLeave {
            queue: "support".to_string(),
            call_id: None,
            wait_secs: None,
            reason: None,
        })
        .await;
        let q = status.queue("support").await.unwrap().unwrap();
        assert_eq!(q.calls_waiting, 0);
    }

    #[tokio::test]
    async fn member_counters_recomputed_from_roster() {
        let (rec, status) = reconciler();
        rec.apply(member_status("op1", false, false)).await;
        rec.apply(member_status("op2", false, true)).await;
        rec.apply(ManagementEvent::AgentLogoff {
            member_id: "op1".to_string(),
        })
        .await;

        let q = status.queue("support").await.unwrap().unwrap();
        assert_eq!(q.members, 1);
        assert_eq!(q.active_members, 1);
    }

    #[tokio::test]
    async fn agent_events_patch_call_meta_when_recorder_attached() {
        let kv: Arc<dyn callflow_infra::KvStore> = Arc::new(MemoryKvStore::new());
        let recorder = Arc::new(CallFlowRecorder::new(kv.clone()));
        let rec = StatusReconciler::new(StatusStore::new(kv)).with_recorder(recorder.clone());

        rec.apply(ManagementEvent::QueueCallerJoin {
            queue: "support".to_string(),
            call_id: Some("c1".to_string()),
        })
        .await;
        rec.apply(ManagementEvent::AgentRing {
            member_id: "op1".to_string(),
            queue: Some("support".to_string()),
            call_id: Some("c1".to_string()),
        })
        .await;
        rec.apply(ManagementEvent::AgentAnswer {
            member_id: "op1".to_string(),
            call_id: Some("c1".to_string()),
        })
        .await;
        rec.apply(ManagementEvent::QueueCallerLeave {
            queue: "support".to_string(),
            call_id: Some("c1".to_string()),
            wait_secs: Some(10),
            reason: Some("answered".to_string()),
        })
        .await;

        let meta = recorder.call_meta("c1").await.unwrap().unwrap();
        assert_eq!(meta.queue_visits.len(), 1);
        assert!(meta.queue_visits[0].wait_ms.is_some());
        assert_eq!(meta.agent_legs.len(), 1);
        assert!(meta.agent_legs[0].ring_ms.is_some());
    }
}
