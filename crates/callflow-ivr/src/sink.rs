//! Flow-log sink seam.
//!
//! The engine records call-flow milestones (node execution, accepted
//! digits, timeouts, handoffs, call end) through this trait; the
//! recorder crate implements it on top of the shared store. The default
//! sink drops everything, which keeps the engine usable in isolation.

use async_trait::async_trait;

use crate::types::CallId;

/// Event names the engine records.
pub const NODE_EXECUTE: &str = "NODE_EXECUTE";
pub const DTMF_ACCEPTED: &str = "DTMF";
pub const TIMEOUT: &str = "TIMEOUT";
pub const QUEUE_HANDOFF: &str = "QUEUE_HANDOFF";
pub const QUEUE_HANDOFF_FAILED: &str = "QUEUE_HANDOFF_FAILED";
pub const CALL_END: &str = "CALL_END";

/// Receives engine flow events. Recording is best-effort; the engine
/// never fails a call on a sink error, so implementations log and
/// swallow internally.
#[async_trait]
pub trait FlowSink: Send + Sync {
    async fn record(&self, call_id: &CallId, event: &str, detail: serde_json::Value);
}

/// Sink that discards everything.
pub struct NoopFlowSink;

#[async_trait]
impl FlowSink for NoopFlowSink {
    async fn record(&self, _call_id: &CallId, _event: &str, _detail: serde_json::Value) {}
}
