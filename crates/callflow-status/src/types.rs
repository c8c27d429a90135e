//! Externally visible status aggregates and call-flow records.
//!
//! Every aggregate carries an `updated_at` stamp and is written as an
//! idempotent upsert with a TTL, so entries self-expire when the source
//! stops emitting events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use callflow_ivr::ChannelState;

/// Reconciled operator activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorState {
    Idle,
    InCall,
    Paused,
    Offline,
}

/// One logical record per queue operator, upserted by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorStatus {
    pub member_id: String,
    pub name: String,
    /// Queue this operator serves, when known.
    pub queue: Option<String>,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub state: OperatorState,
    /// Identifiers of the call currently bridged to this operator.
    pub call_id: Option<String>,
    /// Instantiated channel name (e.g. `PJSIP/op1-000001`).
    pub channel: Option<String>,
    /// Interface/endpoint name from the roster (e.g. `PJSIP/op1`).
    pub interface: Option<String>,
    pub legacy_call_id: Option<String>,
    pub logged_in_at: Option<DateTime<Utc>>,
    pub logged_out_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl OperatorStatus {
    pub fn new(member_id: impl Into<String>, name: impl Into<String>) -> Self {
        OperatorStatus {
            member_id: member_id.into(),
            name: name.into(),
            queue: None,
            paused: false,
            pause_reason: None,
            state: OperatorState::Offline,
            call_id: None,
            channel: None,
            interface: None,
            legacy_call_id: None,
            logged_in_at: None,
            logged_out_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Drop every identifier tying this operator to a live call.
    pub fn clear_call(&mut self) {
        self.call_id = None;
        self.channel = None;
        self.legacy_call_id = None;
    }

    /// The state an operator returns to when a call ends: paused stays
    /// paused, everything else is idle.
    pub fn resting_state(&self) -> OperatorState {
        if self.paused {
            OperatorState::Paused
        } else {
            OperatorState::Idle
        }
    }
}

/// Live channel snapshot, keyed by channel name. Removed on hangup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Protocol unique id of the channel instance.
    pub id: Option<String>,
    /// Instantiated channel name, the lookup key.
    pub name: String,
    pub state: ChannelState,
    pub extension: Option<String>,
    pub context: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate per-queue counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    /// Logged-in members serving this queue.
    pub members: u32,
    /// Members currently on a call.
    pub active_members: u32,
    pub calls_waiting: u32,
    pub longest_wait_secs: u64,
    pub updated_at: DateTime<Utc>,
}

impl QueueStatus {
    pub fn new(name: impl Into<String>) -> Self {
        QueueStatus {
            name: name.into(),
            members: 0,
            active_members: 0,
            calls_waiting: 0,
            longest_wait_secs: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable entry in a call's flow log. Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFlowEvent {
    pub time: DateTime<Utc>,
    pub event: String,
    pub channel_id: Option<String>,
    pub call_id: String,
    pub payload: serde_json::Value,
}

/// One IVR stage visit. A visit whose `entered_at` is absent records an
/// exit that never saw its opener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageVisit {
    pub name: String,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// One pass through a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueVisit {
    pub queue: String,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub wait_ms: Option<i64>,
    pub leave_reason: Option<String>,
}

/// One agent leg: ring, optional answer, optional hangup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLeg {
    pub member_id: String,
    pub ring_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub hangup_at: Option<DateTime<Utc>>,
    pub ring_ms: Option<i64>,
    pub talk_ms: Option<i64>,
}

/// Derived per-call summary, maintained incrementally by the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMeta {
    pub call_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_cause: Option<String>,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub ivr_visits: Vec<StageVisit>,
    pub queue_visits: Vec<QueueVisit>,
    pub agent_legs: Vec<AgentLeg>,
    pub updated_at: DateTime<Utc>,
}

impl CallMeta {
    pub fn new(call_id: impl Into<String>) -> Self {
        CallMeta {
            call_id: call_id.into(),
            started_at: None,
            ended_at: None,
            end_cause: None,
            caller: None,
            callee: None,
            ivr_visits: Vec::new(),
            queue_visits: Vec::new(),
            agent_legs: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time view of everything the reconciler knows, for the
/// dashboard read surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub operators: Vec<OperatorStatus>,
    pub channels: Vec<ChannelStatus>,
    pub queues: Vec<QueueStatus>,
    pub active_calls: Vec<String>,
    pub taken_at: DateTime<Utc>,
}
