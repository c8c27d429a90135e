//! Typed management events.
//!
//! The PBX management feed is a separate stream from call control; raw
//! frames are decoded into this enum at the protocol boundary so the
//! reconciler dispatches on variants, never on event-name strings. An
//! unknown frame fails decoding there and is logged and skipped without
//! ever reaching the reconciler.

use callflow_ivr::ChannelState;
use serde::{Deserialize, Serialize};

/// One decoded event from the management stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagementEvent {
    /// Queue member status report.
    MemberStatus {
        member_id: String,
        name: String,
        queue: Option<String>,
        paused: bool,
        pause_reason: Option<String>,
        /// Explicit in-call flag from the PBX.
        in_call: bool,
    },
    /// A member logged into its queue.
    AgentLogin {
        member_id: String,
        name: String,
        queue: Option<String>,
    },
    /// A member logged out.
    AgentLogoff { member_id: String },
    /// Channel lifecycle snapshot (creation or state transition).
    ChannelUpdate {
        /// Protocol unique id, when the frame carries one.
        unique_id: Option<String>,
        name: String,
        state: ChannelState,
        extension: Option<String>,
        context: Option<String>,
    },
    /// A channel entered a bridge (two legs connected).
    BridgeEnter {
        channel_name: String,
        unique_id: Option<String>,
        legacy_call_id: Option<String>,
    },
    /// A channel hung up.
    Hangup {
        channel_name: String,
        unique_id: Option<String>,
        legacy_call_id: Option<String>,
        cause: Option<String>,
    },
    /// Peer registration status changed.
    PeerStatus { member_id: String, reachable: bool },
    /// A member was paused or unpaused in its queue.
    QueueMemberPaused {
        member_id: String,
        queue: Option<String>,
        paused: bool,
        reason: Option<String>,
    },
    /// A caller joined a queue.
    QueueCallerJoin {
        queue: String,
        call_id: Option<String>,
    },
    /// A caller left a queue (answered, abandoned, or timed out).
    QueueCallerLeave {
        queue: String,
        call_id: Option<String>,
        wait_secs: Option<u64>,
        reason: Option<String>,
    },
    /// A queue started ringing a member for a caller.
    AgentRing {
        member_id: String,
        queue: Option<String>,
        call_id: Option<String>,
    },
    /// A member answered a queued call.
    AgentAnswer {
        member_id: String,
        call_id: Option<String>,
    },
    /// A member's leg of a queued call ended.
    AgentHangup {
        member_id: String,
        call_id: Option<String>,
    },
    /// Sentinel terminating the response burst of a `send_action` call.
    ActionComplete,
}

impl ManagementEvent {
    /// Decode a raw member-status frame from the management stream.
    ///
    /// The wire carries the device state as a numeric string (for
    /// example `{Status: "1", InCall: "1", Paused: "0"}`). Only the
    /// codes that positively mean "on a call" flip `in_call`; an
    /// unknown or legacy code yields a plain idle report rather than a
    /// guess.
    pub fn member_status_from_wire(
        member_id: impl Into<String>,
        name: impl Into<String>,
        queue: Option<String>,
        status: &str,
        paused: &str,
        in_call: &str,
    ) -> ManagementEvent {
        // 2 in use, 3 busy, 7 ringing while in use, 8 on hold.
        let busy_code = matches!(status, "2" | "3" | "7" | "8");
        ManagementEvent::MemberStatus {
            member_id: member_id.into(),
            name: name.into(),
            queue,
            paused: paused == "1",
            pause_reason: None,
            in_call: in_call == "1" || busy_code,
        }
    }

    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ManagementEvent::MemberStatus { .. } => "MEMBER_STATUS",
            ManagementEvent::AgentLogin { .. } => "AGENT_LOGIN",
            ManagementEvent::AgentLogoff { .. } => "AGENT_LOGOFF",
            ManagementEvent::ChannelUpdate { .. } => "CHANNEL_UPDATE",
            ManagementEvent::BridgeEnter { .. } => "BRIDGE_ENTER",
            ManagementEvent::Hangup { .. } => "HANGUP",
            ManagementEvent::PeerStatus { .. } => "PEER_STATUS",
            ManagementEvent::QueueMemberPaused { .. } => "QUEUE_MEMBER_PAUSED",
            ManagementEvent::QueueCallerJoin { .. } => "QUEUE_CALLER_JOIN",
            ManagementEvent::QueueCallerLeave { .. } => "QUEUE_CALLER_LEAVE",
            ManagementEvent::AgentRing { .. } => "AGENT_RING",
            ManagementEvent::AgentAnswer { .. } => "AGENT_ANSWER",
            ManagementEvent::AgentHangup { .. } => "AGENT_HANGUP",
            ManagementEvent::ActionComplete => "ACTION_COMPLETE",
        }
    }
}
