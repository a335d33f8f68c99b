//! Session signaling protocol
//!
//! Typed messages exchanged over the application's persistent bidirectional
//! channel, and the thin client the call core uses to send them and to fan
//! inbound messages out to the session's dispatch loop.
//!
//! The channel itself (a socket server link in production, an in-memory
//! router in tests) is injected through [`SignalingChannel`]. Sending is
//! fire-and-forget: there is no delivery acknowledgment and no retry here.
//! Loss is the call layer's concern, covered by its timers.

use crate::identity::PeerIdentity;
use crate::types::{CallId, IceCandidate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Base delay applied after a channel receive error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Cap for the exponential receive-error backoff.
const RECEIVE_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Signaling errors, for use by channel implementations.
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The persistent channel is closed.
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Message could not be encoded or decoded for the wire.
    #[error("Signaling codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Transport-level failure.
    #[error("Signaling transport error: {0}")]
    Transport(String),
}

/// Reachability reported by the server for the called party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// The callee has an open channel.
    Online,
    /// The callee is not reachable right now.
    Offline,
}

/// How a peer-reported disconnect classified the session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectStatus {
    /// The peer's session errored.
    Failed,
    /// The peer's session ended normally.
    Ended,
}

/// Signaling messages, tagged on the wire by `type`.
///
/// Field keys serialize in camelCase to match the channel's JSON shape
/// (`callId`, `isVideo`, `sdpMid`, ...). Every session-scoped message
/// carries the `callId` it belongs to; `call_waiting` is the one
/// server-side notice without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage<I> {
    /// Caller → callee: a call is being placed.
    #[serde(rename_all = "camelCase")]
    CallRequest {
        /// The callee.
        to: I,
        /// Whether video is requested.
        is_video: bool,
        /// Session identifier minted by the caller.
        call_id: CallId,
    },

    /// Caller → callee: local session description.
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Raw SDP text.
        sdp: String,
        /// The callee.
        to: I,
        /// Whether video is requested.
        is_video: bool,
        /// Session identifier.
        call_id: CallId,
    },

    /// Callee → caller: response session description.
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Raw SDP text.
        sdp: String,
        /// The caller.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Either direction: a connectivity candidate.
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// The candidate payload.
        candidate: IceCandidate,
        /// The other party.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Callee → caller: the call was picked up.
    #[serde(rename_all = "camelCase")]
    CallAccept {
        /// The caller.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Callee → caller: the call was refused (or the callee is busy).
    #[serde(rename_all = "camelCase")]
    CallDecline {
        /// The caller.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Either direction: hang up.
    #[serde(rename_all = "camelCase")]
    CallEnd {
        /// The other party.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Caller → callee: the ring window elapsed without an answer.
    #[serde(rename_all = "camelCase")]
    CallTimeout {
        /// The callee.
        to: I,
        /// Session identifier.
        call_id: CallId,
    },

    /// Server notice about callee reachability while a call rings.
    #[serde(rename_all = "camelCase")]
    CallWaiting {
        /// Human-readable notice.
        message: String,
        /// Callee reachability.
        status: PresenceStatus,
    },

    /// Peer- or server-reported end of the session with details.
    #[serde(rename_all = "camelCase")]
    CallDisconnected {
        /// Which participant the report is about.
        from: I,
        /// Session identifier.
        call_id: CallId,
        /// Human-readable reason.
        reason: String,
        /// Whether the session failed or ended normally.
        status: DisconnectStatus,
        /// Connected duration in whole seconds, if any.
        duration: Option<u64>,
    },
}

impl<I> SignalMessage<I> {
    /// The session this message belongs to, if it carries one.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::CallRequest { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::CallAccept { call_id, .. }
            | Self::CallDecline { call_id, .. }
            | Self::CallEnd { call_id, .. }
            | Self::CallTimeout { call_id, .. }
            | Self::CallDisconnected { call_id, .. } => Some(*call_id),
            Self::CallWaiting { .. } => None,
        }
    }

    /// The addressee, if the message is addressed.
    #[must_use]
    pub fn to(&self) -> Option<&I> {
        match self {
            Self::CallRequest { to, .. }
            | Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::CallAccept { to, .. }
            | Self::CallDecline { to, .. }
            | Self::CallEnd { to, .. }
            | Self::CallTimeout { to, .. } => Some(to),
            Self::CallWaiting { .. } | Self::CallDisconnected { .. } => None,
        }
    }

    /// Wire tag of this message, for log fields.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call_request",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallAccept { .. } => "call_accept",
            Self::CallDecline { .. } => "call_decline",
            Self::CallEnd { .. } => "call_end",
            Self::CallTimeout { .. } => "call_timeout",
            Self::CallWaiting { .. } => "call_waiting",
            Self::CallDisconnected { .. } => "call_disconnected",
        }
    }
}

/// An inbound message together with the sender the channel attached.
#[derive(Debug, Clone)]
pub struct InboundSignal<I> {
    /// Who sent it, as reported by the channel.
    pub from: I,
    /// The message.
    pub message: SignalMessage<I>,
}

/// The injected persistent bidirectional channel.
///
/// Production deployments back this with their socket link; tests use an
/// in-memory router. The channel attaches the sender identity to inbound
/// messages, the same way a socket server stamps the authenticated sender.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Participant identity carried in messages.
    type PeerId: PeerIdentity;

    /// Channel error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one message. Delivery is best-effort; no acknowledgment.
    async fn send(&self, message: SignalMessage<Self::PeerId>) -> Result<(), Self::Error>;

    /// Wait for the next inbound message.
    async fn next_message(&self) -> Result<InboundSignal<Self::PeerId>, Self::Error>;
}

/// Thin client over a [`SignalingChannel`].
///
/// Owns a background pump that pulls inbound messages and fans them out to
/// subscribers. Subscribers are typed mpsc receivers; a subscription lives
/// exactly as long as its handle (dropping it, or calling
/// [`SignalingSubscription::close`], detaches it).
pub struct SignalingClient<C: SignalingChannel> {
    channel: Arc<C>,
    subscribers: Arc<parking_lot::RwLock<Subscribers<C::PeerId>>>,
    next_id: AtomicU64,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

type Subscribers<I> = HashMap<u64, mpsc::UnboundedSender<InboundSignal<I>>>;

impl<C: SignalingChannel> SignalingClient<C> {
    /// Wrap a channel. Call [`start`](Self::start) to begin pumping inbound
    /// messages.
    #[must_use]
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            subscribers: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            pump: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the inbound pump. Idempotent.
    pub fn start(&self) {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return;
        }

        let channel = Arc::clone(&self.channel);
        let subscribers = Arc::clone(&self.subscribers);
        *pump = Some(tokio::spawn(async move {
            let mut backoff = RECEIVE_ERROR_BACKOFF;
            loop {
                match channel.next_message().await {
                    Ok(inbound) => {
                        backoff = RECEIVE_ERROR_BACKOFF;
                        tracing::trace!(
                            message_type = inbound.message.message_type(),
                            from = %inbound.from,
                            "inbound signaling message"
                        );
                        // Drop subscribers whose receiver has gone away.
                        subscribers
                            .write()
                            .retain(|_, tx| tx.send(inbound.clone()).is_ok());
                    }
                    Err(error) => {
                        tracing::warn!(%error, "signaling receive failed; backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECEIVE_ERROR_BACKOFF_MAX);
                    }
                }
            }
        }));
    }

    /// Send a message, fire-and-forget.
    ///
    /// Channel errors are logged and swallowed: the call layer's timers are
    /// the recovery mechanism for lost signaling, not retries here.
    pub async fn send(&self, message: SignalMessage<C::PeerId>) {
        let message_type = message.message_type();
        let call_id = message.call_id();
        if let Err(error) = self.channel.send(message).await {
            tracing::warn!(
                %error,
                message_type,
                call_id = ?call_id,
                "signaling send failed; message dropped"
            );
        }
    }

    /// Register a subscriber for inbound messages.
    #[must_use]
    pub fn subscribe(&self) -> SignalingSubscription<C::PeerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().insert(id, tx);
        SignalingSubscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Stop the pump and detach every subscriber.
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.subscribers.write().clear();
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<C: SignalingChannel> Drop for SignalingClient<C> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// A live subscription to inbound signaling messages.
pub struct SignalingSubscription<I: PeerIdentity> {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundSignal<I>>,
    subscribers: Arc<parking_lot::RwLock<Subscribers<I>>>,
}

impl<I: PeerIdentity> SignalingSubscription<I> {
    /// Receive the next inbound message; `None` once detached.
    pub async fn recv(&mut self) -> Option<InboundSignal<I>> {
        self.rx.recv().await
    }

    /// Detach from the client. Dropping the subscription does the same.
    pub fn close(&mut self) {
        self.subscribers.write().remove(&self.id);
        self.rx.close();
    }
}

impl<I: PeerIdentity> Drop for SignalingSubscription<I> {
    fn drop(&mut self) {
        self.subscribers.write().remove(&self.id);
    }
}
