//! # callflow-ivr
//!
//! The telephony call-flow engine at the core of the callflow stack: an
//! event-driven state machine that walks an IVR tree of nodes (prompt,
//! menu, dial, goto, hang-up, queue handoff) in response to DTMF digits,
//! playback completions, and per-call timers arriving from a PBX control
//! session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            TelephonyEvent bus           │
//! ├─────────────────────────────────────────┤
//! │               IvrEngine                 │
//! │   (single dispatcher, per-call order)   │
//! ├──────────────┬──────────────┬───────────┤
//! │   NodeTree   │ CallStateStore│  Timers  │
//! ├──────────────┴──────────────┴───────────┤
//! │  TelephonyClient (capability interface) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The engine never talks to the PBX directly; it drives the
//! [`TelephonyClient`] capability interface and reacts to
//! [`TelephonyEvent`]s fanned out by the shared event bus. Per-call
//! progress is serialized through an external TTL'd store
//! ([`callflow_infra::kv`]) so any process instance can resume a call
//! after a restart.
//!
//! [`TelephonyClient`]: telephony::TelephonyClient
//! [`TelephonyEvent`]: telephony::TelephonyEvent

pub mod config;
pub mod engine;
pub mod error;
pub mod sink;
pub mod state;
pub mod telephony;
pub mod tree;
pub mod types;
pub mod webhook;

pub use config::IvrConfig;
pub use engine::{IvrEngine, IvrEngineBuilder};
pub use error::{IvrError, Result};
pub use sink::{FlowSink, NoopFlowSink};
pub use state::{ActiveCallState, CallStateStore};
pub use telephony::{
    ChannelState, MediaResolver, OperationError, TelephonyClient, TelephonyEvent,
};
pub use tree::{IvrNode, NodeAction, NodeTree};
pub use types::{CallId, ChannelId, NodeId};
pub use webhook::{HttpWebhook, NodeWebhook, NoopWebhook, WebhookQueue};
