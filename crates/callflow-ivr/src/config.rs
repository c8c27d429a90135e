//! Engine configuration.

use std::time::Duration;

/// Tunables for the IVR navigation engine.
///
/// Defaults match a single-node deployment talking to a local PBX; all
/// values can be overridden with the `with_*` helpers.
#[derive(Debug, Clone)]
pub struct IvrConfig {
    /// Dialplan context used when a bare extension is dialed
    /// (`Local/<ext>@<dial_context>`).
    pub dial_context: String,

    /// Dialplan context holding the queue entry points used during
    /// handoff.
    pub queue_context: String,

    /// Caller id presented on originated legs.
    pub caller_id: String,

    /// Maximum attempts for a retriable control-protocol operation.
    pub max_op_attempts: u32,

    /// Fixed delay between retry attempts.
    pub op_retry_delay: Duration,

    /// Settle delay after stopping audio on DTMF acceptance.
    pub dtmf_settle: Duration,

    /// Delay for playback teardown to settle during queue handoff.
    pub playback_teardown: Duration,

    /// How many times to poll channel state while waiting for the
    /// answered/up state before a queue handoff.
    pub handoff_state_checks: u32,

    /// Delay between those polls.
    pub handoff_state_delay: Duration,

    /// TTL on persisted call snapshots; orphaned state from crashed
    /// calls expires after this.
    pub snapshot_ttl: Duration,
}

impl Default for IvrConfig {
    fn default() -> Self {
        IvrConfig {
            dial_context: "internal".to_string(),
            queue_context: "queues".to_string(),
            caller_id: "ivr".to_string(),
            max_op_attempts: 3,
            op_retry_delay: Duration::from_millis(250),
            dtmf_settle: Duration::from_millis(150),
            playback_teardown: Duration::from_millis(200),
            handoff_state_checks: 5,
            handoff_state_delay: Duration::from_millis(100),
            snapshot_ttl: Duration::from_secs(3600),
        }
    }
}

impl IvrConfig {
    pub fn with_dial_context(mut self, context: impl Into<String>) -> Self {
        self.dial_context = context.into();
        self
    }

    pub fn with_queue_context(mut self, context: impl Into<String>) -> Self {
        self.queue_context = context.into();
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Shrink every internal delay; used by tests to keep scenarios fast.
    pub fn with_fast_timing(mut self) -> Self {
        self.op_retry_delay = Duration::from_millis(5);
        self.dtmf_settle = Duration::from_millis(1);
        self.playback_teardown = Duration::from_millis(1);
        self.handoff_state_delay = Duration::from_millis(1);
        self
    }
}
