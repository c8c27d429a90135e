//! The IVR navigation engine.
//!
//! One engine instance drives every call owned by this process. A
//! router task assigns every incoming command to a per-call worker
//! queue drained by its own task: events for one call are processed
//! strictly in receipt order, while a suspension point in one call
//! (a protocol operation, a settle delay) never stalls another call.
//! Timers re-enter through the router carrying a generation counter; a
//! timer whose generation no longer matches fires into a no-op,
//! because the call has moved on.
//!
//! Failure policy (applied at the handler boundary, per call):
//! - transient resource-allocation failures are retried with a bounded
//!   fixed delay;
//! - "channel no longer exists" is an implicit, idempotent call end;
//! - everything else is logged with call/node context and swallowed —
//!   the engine keeps the call alive in preference to tearing it down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use callflow_infra::{retry_fixed, EventBus, KvStore, RetryOutcome};

use crate::config::IvrConfig;
use crate::error::{IvrError, Result};
use crate::sink::{self, FlowSink, NoopFlowSink};
use crate::state::{ActiveCallState, CallStateStore};
use crate::telephony::{
    ChannelState, DirectMedia, MediaResolver, OperationError, TelephonyClient, TelephonyEvent,
};
use crate::tree::{IvrNode, NodeAction, NodeTree};
use crate::types::{CallId, ChannelId, NodeId};
use crate::webhook::{NodeWebhook, NoopWebhook, WebhookQueue};

/// Commands routed to the per-call workers, in receipt order.
enum EngineCommand {
    Event(TelephonyEvent),
    TimerFired { call_id: CallId, generation: u64 },
}

impl EngineCommand {
    fn call_id(&self) -> &CallId {
        match self {
            EngineCommand::Event(event) => event.call_id(),
            EngineCommand::TimerFired { call_id, .. } => call_id,
        }
    }
}

/// One call's command queue and the task draining it.
struct CallWorker {
    tx: mpsc::UnboundedSender<EngineCommand>,
    handle: JoinHandle<()>,
}

/// Local timer companion for one call. Never serialized; rebuilt from
/// the snapshot when a call is rehydrated.
struct TimerEntry {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Event-driven state machine walking the IVR tree for every live call.
pub struct IvrEngine {
    config: IvrConfig,
    tree: RwLock<NodeTree>,
    telephony: Arc<dyn TelephonyClient>,
    media: Arc<dyn MediaResolver>,
    webhooks: WebhookQueue,
    sink: Arc<dyn FlowSink>,
    calls: CallStateStore,
    timers: DashMap<CallId, TimerEntry>,
    workers: DashMap<CallId, CallWorker>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<EngineCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IvrEngine {
    pub fn builder() -> IvrEngineBuilder {
        IvrEngineBuilder::new()
    }

    /// Load persisted calls and start the dispatcher plus the bus
    /// forwarder.
    pub async fn start(self: &Arc<Self>, bus: &EventBus<TelephonyEvent>) -> Result<()> {
        let resumed = self.calls.load_persisted().await;
        if resumed > 0 {
            info!("IVR engine resumed {} in-flight calls", resumed);
        }

        // Forward bus events into the ordered command channel.
        let mut events = bus.subscribe();
        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(EngineCommand::Event(event)).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("IVR engine lagged behind the event bus by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| IvrError::config("engine already started"))?;
        let engine = self.clone();
        let dispatcher = tokio::spawn(async move {
            engine.dispatch_loop(rx).await;
        });

        let mut tasks = self.tasks.lock();
        tasks.push(forwarder);
        tasks.push(dispatcher);
        info!("IVR engine started");
        Ok(())
    }

    /// Abort background tasks. Persisted snapshots survive for resume.
    pub fn stop(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.workers.retain(|_, worker| {
            worker.handle.abort();
            false
        });
        info!("IVR engine stopped");
    }

    /// Inject an event directly, bypassing the bus. Used by protocol
    /// adapters that own their own delivery ordering.
    pub fn submit(&self, event: TelephonyEvent) {
        let _ = self.tx.send(EngineCommand::Event(event));
    }

    /// Swap in a freshly loaded node tree (resync from the
    /// definitional store). Calls in flight keep their current node
    /// ids; an id that no longer exists makes execution a no-op.
    pub fn replace_tree(&self, tree: NodeTree) {
        let size = tree.len();
        *self.tree.write() = tree;
        info!("IVR node tree replaced ({} nodes)", size);
    }

    /// Current state of one call, if the engine knows it. A call whose
    /// ownership has transferred to the queuing subsystem is reported
    /// as unknown even while its snapshot is still aging out.
    pub async fn call_state(&self, call_id: &CallId) -> Option<ActiveCallState> {
        self.calls.get(call_id).await.filter(|s| !s.handed_off)
    }

    /// Number of calls currently under IVR control in this process.
    pub fn active_call_count(&self) -> usize {
        self.calls.active_count()
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.route(cmd);
        }
        debug!("IVR dispatcher stopped");
    }

    /// Hand a command to its call's worker queue. Routing never awaits
    /// a handler, so one call's suspension points (protocol operations,
    /// settle delays) cannot stall another call's events.
    fn route(self: &Arc<Self>, cmd: EngineCommand) {
        let call_id = cmd.call_id().clone();
        let cmd = if let Some(worker) = self.workers.get(&call_id) {
            match worker.tx.send(cmd) {
                Ok(()) => return,
                // The worker drained out between lookup and send.
                Err(mpsc::error::SendError(cmd)) => cmd,
            }
        } else {
            cmd
        };

        let starts_call = matches!(
            &cmd,
            EngineCommand::Event(TelephonyEvent::CallStart { .. })
        );
        if starts_call || self.calls.contains(&call_id) {
            let tx = self.spawn_worker(&call_id);
            let _ = tx.send(cmd);
        } else {
            // Unknown call: the handlers are quick no-ops, but a slow
            // shared store must not hold up routing either.
            let engine = self.clone();
            tokio::spawn(async move {
                engine.handle_command(cmd).await;
            });
        }
    }

    fn spawn_worker(self: &Arc<Self>, call_id: &CallId) -> mpsc::UnboundedSender<EngineCommand> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        let id = call_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                engine.handle_command(cmd).await;
            }
            debug!("Worker for call {} drained", id);
        });
        self.workers.insert(
            call_id.clone(),
            CallWorker {
                tx: tx.clone(),
                handle,
            },
        );
        tx
    }

    async fn handle_command(&self, cmd: EngineCommand) {
        // Handler boundary: one command's failure must never take the
        // worker down with it.
        match cmd {
            EngineCommand::Event(event) => self.handle_event(event).await,
            EngineCommand::TimerFired {
                call_id,
                generation,
            } => self.on_timer_fired(&call_id, generation).await,
        }
    }

    async fn handle_event(&self, event: TelephonyEvent) {
        match event {
            TelephonyEvent::CallStart {
                call_id,
                channel_id,
                entry_key,
                caller,
            } => self.on_call_start(call_id, channel_id, entry_key, caller).await,
            TelephonyEvent::CallEnd { call_id, cause } => {
                self.cleanup_call(&call_id, cause.as_deref().unwrap_or("call end"))
                    .await
            }
            TelephonyEvent::ChannelDestroyed { call_id } => {
                self.cleanup_call(&call_id, "channel destroyed").await
            }
            TelephonyEvent::Dtmf { call_id, digit } => self.on_dtmf(&call_id, digit).await,
            TelephonyEvent::PlaybackStarted {
                call_id,
                playback_id,
            } => self.on_playback_started(&call_id, playback_id).await,
            TelephonyEvent::PlaybackFinished {
                call_id,
                playback_id,
            } => self.on_playback_finished(&call_id, &playback_id).await,
            TelephonyEvent::ChannelStateChanged { .. } => {
                // Engine polls channel state where it matters (queue
                // handoff); the reconciler owns this event otherwise.
            }
        }
    }

    // === call lifecycle ===================================================

    async fn on_call_start(
        &self,
        call_id: CallId,
        channel_id: ChannelId,
        entry_key: Option<String>,
        caller: Option<String>,
    ) {
        if self.calls.get(&call_id).await.is_some() {
            debug!("Duplicate call start for {} ignored", call_id);
            return;
        }

        let mut state = ActiveCallState::new(call_id.clone(), channel_id.clone());
        state.entry_key = entry_key.clone();
        state.caller = caller;
        self.calls.persist(&state).await;

        let ch = channel_id.clone();
        self.op(&call_id, "answer", || self.telephony.answer(&ch)).await;
        if self.calls.get(&call_id).await.is_none() {
            // Channel vanished while answering.
            return;
        }

        let root = { self.tree.read().root(entry_key.as_deref()).cloned() };
        match root {
            Some(root) => {
                info!("Call {} entering IVR at '{}'", call_id, root.name);
                self.execute_node(&call_id, &root.id).await;
            }
            None => {
                // Configuration error: no tree root. The call stays
                // alive in a degraded state rather than being dropped.
                error!(
                    "No root node for entry key {:?}; call {} left idle",
                    entry_key, call_id
                );
            }
        }
    }

    /// Idempotent teardown of all engine-held state for a call.
    ///
    /// Dropping the worker entry closes its queue; the worker drains
    /// what it already holds and stops. A call that was handed off is
    /// no longer this engine's, so its end is not recorded here.
    async fn cleanup_call(&self, call_id: &CallId, cause: &str) {
        self.cancel_timer(call_id);
        self.timers.remove(call_id);
        self.workers.remove(call_id);

        let owned = self
            .calls
            .get(call_id)
            .await
            .map(|s| !s.handed_off)
            .unwrap_or(false);
        self.calls.remove(call_id).await;
        if owned {
            self.sink
                .record(call_id, sink::CALL_END, json!({ "cause": cause }))
                .await;
            info!("Call {} released ({})", call_id, cause);
        } else {
            debug!("Cleanup for unknown call {} ignored", call_id);
        }
    }

    // === node execution ===================================================

    /// Execute a node for a call: fire the webhook, clear digit-wait
    /// state, log, and dispatch on the action. `goto` chains are
    /// resolved here without a history push.
    async fn execute_node(&self, call_id: &CallId, node_id: &NodeId) {
        let Some(mut state) = self.calls.get(call_id).await else {
            return;
        };
        if state.handed_off {
            return;
        }

        let Some(mut node) = self.lookup_node(node_id) else {
            warn!("Call {}: node {} not in tree, execution is a no-op", call_id, node_id);
            return;
        };

        let mut hops = 0;
        while node.action == NodeAction::Goto {
            hops += 1;
            if hops > 32 {
                error!("Call {}: goto chain from {} exceeds 32 hops", call_id, node_id);
                return;
            }
            let Some(target) = node.payload.clone() else {
                warn!("Call {}: goto node {} has no target", call_id, node.id);
                return;
            };
            match self.lookup_node(&NodeId::new(target.clone())) {
                Some(next) => node = next,
                None => {
                    warn!("Call {}: goto target {} not in tree", call_id, target);
                    return;
                }
            }
        }

        self.webhooks.enqueue(call_id, &node.id, &node.name);
        self.cancel_timer(call_id);
        state.awaiting_digit = false;
        state.timeout_deferred = false;
        state.current_node = Some(node.id.clone());
        self.calls.persist(&state).await;

        self.sink
            .record(
                call_id,
                sink::NODE_EXECUTE,
                json!({ "node": node.id.0, "name": node.name, "action": node.action }),
            )
            .await;

        match node.action {
            NodeAction::Playback | NodeAction::Menu => self.run_prompt(call_id, &node).await,
            NodeAction::Dial => self.run_dial(call_id, &node).await,
            NodeAction::Queue => self.run_queue_handoff(call_id, &node).await,
            NodeAction::Hangup => self.run_hangup(call_id).await,
            NodeAction::Goto => {} // resolved above
        }
    }

    async fn run_prompt(&self, call_id: &CallId, node: &IvrNode) {
        let Some(payload) = node.payload.clone() else {
            // A menu with no prompt waits immediately.
            if node.is_menu() {
                self.start_waiting(call_id, node).await;
            }
            return;
        };

        let Some(media) = self.media.resolve(&payload).await else {
            warn!(
                "Call {} node {}: media '{}' unresolvable, prompt skipped",
                call_id, node.id, payload
            );
            if node.is_menu() {
                self.start_waiting(call_id, node).await;
            }
            return;
        };

        let Some(state) = self.calls.get(call_id).await else {
            return;
        };
        let ch = state.channel_id.clone();
        let started = self
            .op(call_id, "play", || self.telephony.play(&ch, &media))
            .await;

        // Without audio there is no playback-finished to transition a
        // menu into waiting, so do it now.
        if started.is_none() && node.is_menu() && self.calls.get(call_id).await.is_some() {
            self.start_waiting(call_id, node).await;
        }
    }

    async fn run_dial(&self, call_id: &CallId, node: &IvrNode) {
        let Some(target) = node.payload.clone() else {
            warn!("Call {}: dial node {} has no target", call_id, node.id);
            return;
        };

        // Bare extensions become local-channel dialplan addresses;
        // anything protocol-qualified passes through untouched.
        let endpoint = if target.contains('/') {
            target
        } else {
            format!("Local/{}@{}", target, self.config.dial_context)
        };

        if let Some(leg) = self
            .op(call_id, "originate", || {
                self.telephony.originate(&endpoint, &self.config.caller_id)
            })
            .await
        {
            info!("Call {}: originated leg {} to {}", call_id, leg, endpoint);
        }
    }

    async fn run_hangup(&self, call_id: &CallId) {
        if let Some(state) = self.calls.get(call_id).await {
            let ch = state.channel_id.clone();
            self.op(call_id, "hangup", || self.telephony.hangup(&ch)).await;
        }
        self.cleanup_call(call_id, "hangup node").await;
    }

    /// Hand the call off to the queuing subsystem. On success the call
    /// leaves the engine's responsibility immediately and exactly once;
    /// on failure of every candidate it stays under IVR control.
    async fn run_queue_handoff(&self, call_id: &CallId, node: &IvrNode) {
        let Some(queue_name) = node.payload.clone() else {
            warn!("Call {}: queue node {} has no queue name", call_id, node.id);
            return;
        };
        let Some(mut state) = self.calls.get(call_id).await else {
            return;
        };
        let ch = state.channel_id.clone();

        // Step 1: the queue entry point expects an answered channel.
        let mut up = false;
        for _ in 0..self.config.handoff_state_checks {
            match self.telephony.channel_state(&ch).await {
                Ok(ChannelState::Up) => {
                    up = true;
                    break;
                }
                Ok(_) => tokio::time::sleep(self.config.handoff_state_delay).await,
                Err(e) if e.is_gone() => {
                    self.cleanup_call(call_id, "channel gone before handoff").await;
                    return;
                }
                Err(e) => {
                    warn!("Call {}: channel state check failed: {}", call_id, e);
                    break;
                }
            }
        }
        if !up {
            self.op(call_id, "answer", || self.telephony.answer(&ch)).await;
            if self.calls.get(call_id).await.is_none() {
                return;
            }
        }

        // Step 2: no further DTMF handling or timers for this call.
        self.cancel_timer(call_id);
        state.awaiting_digit = false;
        state.timeout_deferred = false;

        // Step 3: stop all audio and let playback teardown settle.
        let playbacks: Vec<String> = state.active_playbacks.drain().collect();
        for pb in playbacks {
            if let Err(e) = self.telephony.stop_playback(&pb).await {
                debug!("Call {}: stop playback {} failed: {}", call_id, pb, e);
            }
        }
        self.calls.persist(&state).await;
        tokio::time::sleep(self.config.playback_teardown).await;

        // Step 4: the channel may have died while audio was tearing down.
        if let Err(e) = self.telephony.channel_state(&ch).await {
            if e.is_gone() {
                self.cleanup_call(call_id, "channel gone during handoff").await;
                return;
            }
        }

        // Step 5: candidate entry points, in order; any 2xx is success.
        let candidates = [format!("queue_{}", queue_name), queue_name.clone()];
        for extension in &candidates {
            match self
                .telephony
                .redirect_to_extension(&ch, extension, &self.config.queue_context)
                .await
            {
                Ok(code) if (200..300).contains(&code) => {
                    // Step 6: ownership transfers. The snapshot is
                    // marked handed off and left to age out on its
                    // TTL, so a rehydrating instance sees the marker
                    // instead of resurrecting the call; dropping the
                    // local copy is what makes later events no-ops.
                    state.handed_off = true;
                    self.calls.persist(&state).await;
                    self.sink
                        .record(
                            call_id,
                            sink::QUEUE_HANDOFF,
                            json!({ "queue": queue_name, "extension": extension, "code": code }),
                        )
                        .await;
                    self.cancel_timer(call_id);
                    self.timers.remove(call_id);
                    self.calls.release(call_id).await;
                    self.workers.remove(call_id);
                    info!(
                        "Call {} handed off to queue '{}' via {}",
                        call_id, queue_name, extension
                    );
                    return;
                }
                Ok(code) => {
                    warn!(
                        "Call {}: handoff candidate {} rejected with {}",
                        call_id, extension, code
                    );
                }
                Err(e) => {
                    warn!(
                        "Call {}: handoff candidate {} failed: {}",
                        call_id, extension, e
                    );
                }
            }
        }

        self.sink
            .record(
                call_id,
                sink::QUEUE_HANDOFF_FAILED,
                json!({ "queue": queue_name }),
            )
            .await;
        warn!(
            "Call {}: all handoff candidates for '{}' failed, staying under IVR control",
            call_id, queue_name
        );
    }

    // === digit handling ===================================================

    async fn on_dtmf(&self, call_id: &CallId, digit: char) {
        let Some(mut state) = self.calls.get(call_id).await else {
            debug!("DTMF for unknown call {} ignored", call_id);
            return;
        };
        if state.handed_off {
            return;
        }
        let Some(node_id) = state.current_node.clone() else {
            return;
        };
        let Some(node) = self.lookup_node(&node_id) else {
            warn!("Call {}: current node {} no longer in tree", call_id, node_id);
            return;
        };

        let audio_active = !state.active_playbacks.is_empty();
        let accepted = state.awaiting_digit
            || (node.is_menu() && node.allow_early_dtmf && audio_active);
        if !accepted {
            // Not waiting and not an interruptible menu prompt: the
            // digit leaves no trace beyond the bus audit.
            debug!("Call {}: digit '{}' ignored", call_id, digit);
            return;
        }

        if audio_active {
            let playbacks: Vec<String> = state.active_playbacks.drain().collect();
            for pb in playbacks {
                if let Err(e) = self.telephony.stop_playback(&pb).await {
                    debug!("Call {}: stop playback {} failed: {}", call_id, pb, e);
                }
            }
            self.calls.persist(&state).await;
            tokio::time::sleep(self.config.dtmf_settle).await;
        }

        self.sink
            .record(
                call_id,
                sink::DTMF_ACCEPTED,
                json!({ "digit": digit.to_string(), "node": node_id.0 }),
            )
            .await;

        self.cancel_timer(call_id);
        state.awaiting_digit = false;
        state.timeout_deferred = false;
        self.calls.persist(&state).await;

        if digit == node.repeat_digit {
            self.execute_node(call_id, &node.id).await;
        } else if digit == node.root_digit {
            let root = { self.tree.read().root(state.entry_key.as_deref()).cloned() };
            match root {
                Some(root) => {
                    if let Some(mut s) = self.calls.get(call_id).await {
                        s.history.clear();
                        self.calls.persist(&s).await;
                    }
                    self.execute_node(call_id, &root.id).await;
                }
                None => warn!("Call {}: no root to jump to", call_id),
            }
        } else if digit == node.back_digit && node.parent.is_some() {
            let Some(mut s) = self.calls.get(call_id).await else {
                return;
            };
            let target = s.history.pop().or_else(|| node.parent.clone());
            self.calls.persist(&s).await;
            if let Some(target) = target {
                self.execute_node(call_id, &target).await;
            }
        } else if let Some(child) = {
            let tree = self.tree.read();
            tree.child_by_digit(&node.id, digit).cloned()
        } {
            if let Some(mut s) = self.calls.get(call_id).await {
                s.history.push(node.id.clone());
                self.calls.persist(&s).await;
            }
            self.execute_node(call_id, &child.id).await;
        } else {
            // Unknown digit: replay the current menu.
            self.execute_node(call_id, &node.id).await;
        }
    }

    // === playback lifecycle ===============================================

    async fn on_playback_started(&self, call_id: &CallId, playback_id: String) {
        let Some(mut state) = self.calls.get(call_id).await else {
            return;
        };
        if state.handed_off {
            return;
        }
        state.active_playbacks.insert(playback_id);
        self.calls.persist(&state).await;
    }

    async fn on_playback_finished(&self, call_id: &CallId, playback_id: &str) {
        let Some(mut state) = self.calls.get(call_id).await else {
            return;
        };
        if state.handed_off {
            return;
        }
        state.active_playbacks.remove(playback_id);
        let audio_done = state.active_playbacks.is_empty();

        let node = state
            .current_node
            .clone()
            .and_then(|id| self.lookup_node(&id));

        // A deferred digit-wait timeout arms once the last playback
        // clears; this is what keeps timers from racing audio.
        if audio_done && state.awaiting_digit && state.timeout_deferred {
            state.timeout_deferred = false;
            self.calls.persist(&state).await;
            if let Some(node) = &node {
                if node.timeout_ms > 0 {
                    self.arm_timer(call_id, Duration::from_millis(node.timeout_ms));
                }
            }
            return;
        }

        let was_waiting = state.awaiting_digit;
        self.calls.persist(&state).await;

        let Some(node) = node else {
            return;
        };
        if !audio_done {
            return;
        }

        match node.action {
            NodeAction::Menu if !was_waiting => {
                // Prompt done: the menu now waits for its digit.
                self.start_waiting(call_id, &node).await;
            }
            NodeAction::Playback => {
                // Return control to the parent menu; never hang up on
                // an unhandled completion.
                let parent_menu = {
                    let tree = self.tree.read();
                    tree.nearest_menu_ancestor(&node.id).cloned()
                };
                match parent_menu {
                    Some(menu) => {
                        let Some(mut s) = self.calls.get(call_id).await else {
                            return;
                        };
                        if s.history.last() == Some(&menu.id) {
                            s.history.pop();
                        }
                        s.current_node = Some(menu.id.clone());
                        self.calls.persist(&s).await;
                        self.start_waiting(call_id, &menu).await;
                    }
                    None => {
                        let Some(mut s) = self.calls.get(call_id).await else {
                            return;
                        };
                        s.awaiting_digit = false;
                        self.calls.persist(&s).await;
                        debug!("Call {}: playback done, no parent menu, idling", call_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Begin waiting for a digit on `node`, arming its timeout if one
    /// is configured. The timer is deferred while audio is active.
    async fn start_waiting(&self, call_id: &CallId, node: &IvrNode) {
        let Some(mut state) = self.calls.get(call_id).await else {
            return;
        };
        if state.handed_off {
            return;
        }
        state.awaiting_digit = true;
        if node.timeout_ms > 0 {
            if state.active_playbacks.is_empty() {
                state.timeout_deferred = false;
                self.arm_timer(call_id, Duration::from_millis(node.timeout_ms));
            } else {
                state.timeout_deferred = true;
            }
        }
        self.calls.persist(&state).await;
    }

    // === timers ===========================================================

    fn arm_timer(&self, call_id: &CallId, after: Duration) {
        let mut entry = self
            .timers
            .entry(call_id.clone())
            .or_insert(TimerEntry {
                generation: 0,
                handle: None,
            });
        if let Some(handle) = entry.handle.take() {
            handle.abort();
        }
        entry.generation += 1;
        let generation = entry.generation;
        let tx = self.tx.clone();
        let call_id = call_id.clone();
        entry.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(EngineCommand::TimerFired {
                call_id,
                generation,
            });
        }));
    }

    fn cancel_timer(&self, call_id: &CallId) {
        if let Some(mut entry) = self.timers.get_mut(call_id) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
            // Bumping the generation makes any already-queued fire stale.
            entry.generation += 1;
        }
    }

    async fn on_timer_fired(&self, call_id: &CallId, generation: u64) {
        let current = self.timers.get(call_id).map(|e| e.generation);
        if current != Some(generation) {
            debug!("Stale timer for call {} ignored", call_id);
            return;
        }
        let Some(state) = self.calls.get(call_id).await else {
            return;
        };
        if state.handed_off || !state.awaiting_digit {
            return;
        }

        self.sink
            .record(
                call_id,
                sink::TIMEOUT,
                json!({ "node": state.current_node.as_ref().map(|n| n.0.clone()) }),
            )
            .await;

        let node = state
            .current_node
            .clone()
            .and_then(|id| self.lookup_node(&id));
        match node {
            Some(node) if node.is_menu() => {
                // Replay the menu.
                self.execute_node(call_id, &node.id).await;
            }
            Some(node) => {
                let ancestor = {
                    let tree = self.tree.read();
                    tree.nearest_menu_ancestor(&node.id).cloned()
                };
                match ancestor {
                    Some(menu) => self.execute_node(call_id, &menu.id).await,
                    None => self.clear_waiting(call_id).await,
                }
            }
            None => self.clear_waiting(call_id).await,
        }
    }

    /// Give up on the digit wait but keep the call alive; a timeout is
    /// never a reason to hang up.
    async fn clear_waiting(&self, call_id: &CallId) {
        if let Some(mut state) = self.calls.get(call_id).await {
            state.awaiting_digit = false;
            state.timeout_deferred = false;
            self.calls.persist(&state).await;
        }
    }

    // === protocol operation wrapper =======================================

    fn lookup_node(&self, id: &NodeId) -> Option<IvrNode> {
        self.tree.read().get(id).cloned()
    }

    /// Run a control-protocol operation under the engine's failure
    /// policy. Returns the value on success; on failure the policy has
    /// already been applied and `None` comes back.
    async fn op<T, F, Fut>(&self, call_id: &CallId, what: &str, f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        let outcome = retry_fixed(
            self.config.max_op_attempts,
            self.config.op_retry_delay,
            OperationError::is_transient,
            f,
        )
        .await;

        match outcome {
            RetryOutcome::Completed(value) => Some(value),
            RetryOutcome::Aborted(e) if e.is_gone() => {
                debug!("Call {}: {} hit a vanished channel, implicit call end", call_id, what);
                self.cleanup_call(call_id, "channel gone").await;
                None
            }
            RetryOutcome::Aborted(e) => {
                warn!("Call {}: {} failed: {}", call_id, what, e);
                None
            }
            RetryOutcome::Exhausted(e) => {
                warn!(
                    "Call {}: {} exhausted {} attempts: {}",
                    call_id, what, self.config.max_op_attempts, e
                );
                None
            }
        }
    }
}

/// Builder for [`IvrEngine`] with the collaborators it needs.
pub struct IvrEngineBuilder {
    config: IvrConfig,
    tree: NodeTree,
    telephony: Option<Arc<dyn TelephonyClient>>,
    media: Arc<dyn MediaResolver>,
    webhook: Arc<dyn NodeWebhook>,
    sink: Arc<dyn FlowSink>,
    store: Option<Arc<dyn KvStore>>,
}

impl IvrEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: IvrConfig::default(),
            tree: NodeTree::new(),
            telephony: None,
            media: Arc::new(DirectMedia),
            webhook: Arc::new(NoopWebhook),
            sink: Arc::new(NoopFlowSink),
            store: None,
        }
    }

    pub fn with_config(mut self, config: IvrConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tree(mut self, tree: NodeTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_telephony(mut self, client: Arc<dyn TelephonyClient>) -> Self {
        self.telephony = Some(client);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaResolver>) -> Self {
        self.media = media;
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn NodeWebhook>) -> Self {
        self.webhook = webhook;
        self
    }

    pub fn with_flow_sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Assemble the engine. Must run inside a Tokio runtime (the
    /// webhook delivery task is spawned here).
    pub fn build(self) -> Result<Arc<IvrEngine>> {
        let telephony = self
            .telephony
            .ok_or_else(|| IvrError::config("telephony client not provided"))?;
        let store = self
            .store
            .ok_or_else(|| IvrError::config("shared state store not provided"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot_ttl = self.config.snapshot_ttl;
        Ok(Arc::new(IvrEngine {
            config: self.config,
            tree: RwLock::new(self.tree),
            telephony,
            media: self.media,
            webhooks: WebhookQueue::start(self.webhook),
            sink: self.sink,
            calls: CallStateStore::new(store, snapshot_ttl),
            timers: DashMap::new(),
            workers: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

impl Default for IvrEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
