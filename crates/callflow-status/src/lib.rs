//! # callflow-status
//!
//! Event reconciliation and call-flow recording for the callflow stack.
//!
//! The PBX emits a management-event stream (distinct from call control)
//! describing operators, channels, and queues. This crate turns that
//! stream into consistent, externally visible aggregates:
//!
//! - [`StatusReconciler`] applies each [`ManagementEvent`] to TTL'd
//!   operator/channel/queue records in the shared store.
//! - [`CallFlowRecorder`] keeps an append-only per-call event log plus
//!   a derived [`CallMeta`] summary with back-filled durations for
//!   paired events. It implements the engine's flow-sink seam, so IVR
//!   milestones land in the same record.
//! - [`QueryService`] is the read surface (single lookups, listings,
//!   dashboard snapshot, roster resync) consumed by out-of-process
//!   controllers.
//! - [`ManagementSession`] models the action interface whose response
//!   bursts terminate in a sentinel event.

pub mod error;
pub mod events;
pub mod query;
pub mod reconciler;
pub mod recorder;
pub mod session;
pub mod store;
pub mod types;

pub use error::{Result, StatusError};
pub use events::ManagementEvent;
pub use query::{QueryService, RosterOperator, RosterProvider};
pub use reconciler::StatusReconciler;
pub use recorder::{CallFlowRecorder, FLOW_TTL};
pub use session::{collect_action_response, ManagementSession};
pub use store::{StatusStore, STATUS_TTL};
pub use types::{
    AgentLeg, CallFlowEvent, CallMeta, ChannelState, ChannelStatus, DashboardSnapshot,
    OperatorState, OperatorStatus, QueueStatus, QueueVisit, StageVisit,
};
