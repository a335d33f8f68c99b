//! Call session types and data structures

use crate::identity::PeerIdentity;
use crate::media::MediaStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a call.
///
/// Created by the initiator and echoed by both parties for the lifetime of
/// the session; used to disambiguate overlapping or late signaling messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the session this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Initiated the call.
    Caller,
    /// Received the call.
    Callee,
}

/// Call session state.
///
/// `Idle` is both the initial and the terminal resting state; `Ended` and
/// `Failed` are transient terminal states that resolve to `Idle` once
/// cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No session.
    Idle,
    /// Outgoing call placed, waiting for the callee.
    Calling,
    /// Incoming call received, waiting for local accept/decline.
    Ringing,
    /// Both sides engaged, negotiation in progress.
    Connecting,
    /// Media flowing.
    Connected,
    /// Session finished normally (hangup, decline, timeout).
    Ended,
    /// Session finished on an error path.
    Failed,
}

impl CallState {
    /// Whether a session in this state still exists.
    #[must_use]
    pub fn is_active(self) -> bool {
        self != Self::Idle
    }

    /// Whether this is a terminal state (`Ended` or `Failed`).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// The edges here are the only ones a session ever travels; anything
    /// else is refused by the state machine and logged.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Calling)
                | (Self::Idle, Self::Ringing)
                | (Self::Calling, Self::Connecting)
                | (Self::Ringing, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Calling, Self::Ended | Self::Failed)
                | (Self::Ringing, Self::Ended | Self::Failed)
                | (Self::Connecting, Self::Ended | Self::Failed)
                | (Self::Connected, Self::Ended | Self::Failed)
                | (Self::Ended, Self::Idle)
                | (Self::Failed, Self::Idle)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a session reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Local user hung up.
    Hangup,
    /// Remote peer hung up or reported a normal disconnect.
    RemoteHangup,
    /// Call was declined (explicitly, or auto-declined while busy).
    Declined,
    /// Nobody answered within the ring window.
    NoAnswer,
    /// Transport or media error ended the session.
    Failed,
}

impl EndReason {
    /// Whether this reason represents an error path.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hangup => "hangup",
            Self::RemoteHangup => "remote hangup",
            Self::Declined => "declined",
            Self::NoAnswer => "no answer",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Kind of session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Initial or renegotiation offer.
    Offer,
    /// Response to an offer.
    Answer,
}

/// A session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text.
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path proposal for peer connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line.
    pub candidate: String,
    /// Media stream identification tag the candidate belongs to.
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Build a candidate from its candidate line only.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// User-facing notices surfaced by the session without changing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// Server-reported reachability of the callee while the call rings.
    PeerPresence {
        /// Human-readable message from the server.
        message: String,
        /// Whether the callee is currently reachable.
        online: bool,
    },
    /// Peer-reported disconnect details.
    PeerDisconnected {
        /// Reason reported by the peer.
        reason: String,
        /// Whether the peer reported an error (`true`) or a normal end.
        failed: bool,
        /// Connected duration in whole seconds, as reported by the peer.
        duration_secs: Option<u64>,
    },
}

/// Events emitted by the call session for UI collaborators.
#[derive(Debug, Clone)]
pub enum CallEvent<I: PeerIdentity> {
    /// An incoming call is ringing.
    IncomingCall {
        /// Session identifier.
        call_id: CallId,
        /// The caller.
        from: I,
        /// Whether the caller requested video.
        video: bool,
    },
    /// The session state changed.
    StateChanged {
        /// Session identifier.
        call_id: CallId,
        /// New state.
        state: CallState,
    },
    /// The first remote media stream arrived and is ready to render.
    RemoteStreamReady {
        /// Session identifier.
        call_id: CallId,
        /// Handle to the remote stream.
        stream: Arc<MediaStream>,
    },
    /// A second incoming call was auto-declined while a session was active.
    MissedCall {
        /// Identifier of the declined call.
        call_id: CallId,
        /// The caller that was turned away.
        from: I,
    },
    /// A notice for the user; no state change.
    Notice(CallNotice),
    /// The session reached a terminal state and was cleaned up.
    Ended {
        /// Session identifier.
        call_id: CallId,
        /// Why it ended.
        reason: EndReason,
        /// Connected duration in whole seconds, if it ever connected.
        duration_secs: Option<u64>,
    },
}

/// Read-only view of the session published to UI collaborators.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Current state.
    pub state: CallState,
    /// Whether the session currently carries video.
    pub is_video_call: bool,
    /// User-facing message from the most recent failure, if any.
    ///
    /// Survives the terminal reset to `Idle` so the UI can display it;
    /// cleared when the next session starts.
    pub error: Option<String>,
    /// Time since the session connected; `None` before that.
    pub duration: Option<chrono::Duration>,
    /// Whether the local microphone track is muted.
    pub is_audio_muted: bool,
    /// Whether the local camera track is muted.
    pub is_video_muted: bool,
}

impl CallSnapshot {
    /// Snapshot of a client with no session.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            is_video_call: false,
            error: None,
            duration: None,
            is_audio_muted: false,
            is_video_muted: false,
        }
    }

    /// Connected duration in whole seconds, if connected.
    #[must_use]
    pub fn duration_secs(&self) -> Option<u64> {
        self.duration.map(|d| d.num_seconds().max(0) as u64)
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
