//! The telephony capability interface.
//!
//! The engine treats the PBX control session as a capability: a set of
//! imperative operations ([`TelephonyClient`]) and an exhaustive event
//! vocabulary ([`TelephonyEvent`]). The concrete protocol client lives
//! outside this crate and publishes events onto the shared bus; nothing
//! here dispatches on event-name strings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, ChannelId};

/// Failure taxonomy for control-protocol operations.
///
/// The engine's handling differs per variant: transient allocation
/// failures are retried, a vanished channel is an implicit call end,
/// and everything else is logged with call context and swallowed.
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    /// The PBX could not allocate a resource right now; retriable.
    #[error("Resource allocation failed: {0}")]
    AllocationFailed(String),

    /// The channel (or playback) no longer exists on the PBX.
    #[error("No longer exists: {0}")]
    NotFound(String),

    /// Any other protocol failure.
    #[error("{0}")]
    Other(String),
}

impl OperationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OperationError::AllocationFailed(_))
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, OperationError::NotFound(_))
    }
}

/// Result alias for control-protocol operations.
pub type OpResult<T> = std::result::Result<T, OperationError>;

/// Lifecycle state of one channel on the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Down,
    Reserved,
    OffHook,
    Dialing,
    Ring,
    Up,
    Busy,
}

/// Imperative operations on the PBX control session.
///
/// Implementations wrap the real protocol client; the engine only ever
/// sees this trait, which keeps every test a plain mock away.
#[async_trait]
pub trait TelephonyClient: Send + Sync {
    /// Start audio on a channel. Returns the playback handle.
    async fn play(&self, channel: &ChannelId, media: &str) -> OpResult<String>;

    /// Stop one active playback by handle.
    async fn stop_playback(&self, playback_id: &str) -> OpResult<()>;

    /// Originate a new call leg to `endpoint`.
    async fn originate(&self, endpoint: &str, caller_id: &str) -> OpResult<ChannelId>;

    /// Answer a channel.
    async fn answer(&self, channel: &ChannelId) -> OpResult<()>;

    /// Hang a channel up.
    async fn hangup(&self, channel: &ChannelId) -> OpResult<()>;

    /// Continue the channel at a dialplan extension. Returns the
    /// protocol-level response status code; any 2xx is success.
    async fn redirect_to_extension(
        &self,
        channel: &ChannelId,
        extension: &str,
        context: &str,
    ) -> OpResult<u16>;

    /// Current lifecycle state of a channel.
    async fn channel_state(&self, channel: &ChannelId) -> OpResult<ChannelState>;
}

/// Raw events emitted by the PBX control session.
#[derive(Debug, Clone)]
pub enum TelephonyEvent {
    /// A call entered the IVR application.
    CallStart {
        call_id: CallId,
        channel_id: ChannelId,
        /// Entry key passed by the dialplan to pick the tree root.
        entry_key: Option<String>,
        caller: Option<String>,
    },
    /// The call ended (hangup observed by the protocol layer).
    CallEnd {
        call_id: CallId,
        cause: Option<String>,
    },
    /// A keypad digit was received.
    Dtmf { call_id: CallId, digit: char },
    /// Audio started on the call.
    PlaybackStarted {
        call_id: CallId,
        playback_id: String,
    },
    /// Audio finished (or was stopped) on the call.
    PlaybackFinished {
        call_id: CallId,
        playback_id: String,
    },
    /// The channel changed lifecycle state.
    ChannelStateChanged {
        call_id: CallId,
        state: ChannelState,
    },
    /// The channel was destroyed on the PBX side.
    ChannelDestroyed { call_id: CallId },
}

impl TelephonyEvent {
    /// The call this event belongs to.
    pub fn call_id(&self) -> &CallId {
        match self {
            TelephonyEvent::CallStart { call_id, .. }
            | TelephonyEvent::CallEnd { call_id, .. }
            | TelephonyEvent::Dtmf { call_id, .. }
            | TelephonyEvent::PlaybackStarted { call_id, .. }
            | TelephonyEvent::PlaybackFinished { call_id, .. }
            | TelephonyEvent::ChannelStateChanged { call_id, .. }
            | TelephonyEvent::ChannelDestroyed { call_id } => call_id,
        }
    }

    /// Stable event name used for flow logging.
    pub fn name(&self) -> &'static str {
        match self {
            TelephonyEvent::CallStart { .. } => "CALL_START",
            TelephonyEvent::CallEnd { .. } => "CALL_END",
            TelephonyEvent::Dtmf { .. } => "DTMF",
            TelephonyEvent::PlaybackStarted { .. } => "PLAYBACK_STARTED",
            TelephonyEvent::PlaybackFinished { .. } => "PLAYBACK_FINISHED",
            TelephonyEvent::ChannelStateChanged { .. } => "CHANNEL_STATE",
            TelephonyEvent::ChannelDestroyed { .. } => "CHANNEL_DESTROYED",
        }
    }
}

/// Resolves a node payload to a playable media reference.
///
/// A payload is either a direct media name or an indirect reference
/// (`media:<id>`) resolved against an external media catalog. Failure
/// to resolve degrades the call (the prompt is skipped) rather than
/// tearing it down.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, payload: &str) -> Option<String>;
}

/// Pass-through resolver: the payload already names the media.
pub struct DirectMedia;

#[async_trait]
impl MediaResolver for DirectMedia {
    async fn resolve(&self, payload: &str) -> Option<String> {
        Some(payload.to_string())
    }
}
