//! Peer transport ownership and connectivity supervision
//!
//! The concrete peer transport (a WebRTC engine binding in production, a
//! scripted double in tests) is injected through [`PeerTransport`] /
//! [`PeerTransportFactory`]. [`TransportController`] owns one backend for
//! the lifetime of a session: it forwards negotiation calls, attaches local
//! tracks, surfaces the first remote stream, and runs a monitor task that
//! translates raw ICE connectivity into the five observable [`LinkState`]s.
//!
//! # Reconnection
//!
//! On `Degraded` the monitor waits [`ReconnectPolicy::delay`], then issues an
//! ICE restart if the link has not recovered, repeating up to
//! [`ReconnectPolicy::max_restarts`] times in one degraded period. If the
//! link is still degraded after the final restart's wait, the controller
//! reports `Failed` and stops; it never issues another restart. A recovery
//! resets the attempt counter.

use crate::media::{MediaStream, MediaTrack};
use crate::types::{CallId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The controller (or backend) has been closed.
    #[error("Transport closed")]
    Closed,

    /// Offer/answer/description handling failed.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Backend-level failure.
    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// A reachability relay (STUN/TURN-class) the transport may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    /// Relay URLs.
    pub urls: Vec<String>,
    /// Username for authenticated relays.
    pub username: Option<String>,
    /// Credential for authenticated relays.
    pub credential: Option<String>,
}

impl RelayServer {
    /// An unauthenticated relay from a single URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// How media and control are multiplexed onto transport channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundlePolicy {
    /// Bundle everything onto a single channel.
    #[default]
    MaxBundle,
    /// Let the backend balance channels.
    Balanced,
}

/// Fixed per-session transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Reachability relays handed to the backend.
    pub relays: Vec<RelayServer>,
    /// Channel bundling policy.
    pub bundle_policy: BundlePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relays: vec![RelayServer::new("stun:stun.l.google.com:19302")],
            bundle_policy: BundlePolicy::MaxBundle,
        }
    }
}

/// Bounded reconnection policy owned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// How long to stay degraded before each restart attempt.
    pub delay: Duration,
    /// Maximum ICE restarts in one degraded period.
    pub max_restarts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_restarts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another restart may be attempted after `attempts` so far.
    #[must_use]
    pub fn allows_restart(&self, attempts: u32) -> bool {
        attempts < self.max_restarts
    }
}

/// Raw ICE connectivity reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceLinkState {
    /// Gathering has not produced activity yet.
    New,
    /// Connectivity checks in progress.
    Checking,
    /// A usable pair was found.
    Connected,
    /// Checks finished with a nominated pair.
    Completed,
    /// The nominated pair stopped working.
    Disconnected,
    /// No pair works.
    Failed,
    /// The backend was closed.
    Closed,
}

/// Observable transport connectivity exposed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing negotiated yet.
    New,
    /// Negotiation or connectivity checks running.
    Connecting,
    /// Media can flow.
    Connected,
    /// Connectivity lost; reconnection in progress.
    Degraded,
    /// Connectivity unrecoverable.
    Failed,
}

impl LinkState {
    /// Map raw backend connectivity onto the observable state, if it is
    /// observable at all (`Closed` is not: closure is initiated locally).
    #[must_use]
    pub fn from_ice(ice: IceLinkState) -> Option<Self> {
        match ice {
            IceLinkState::New => Some(Self::New),
            IceLinkState::Checking => Some(Self::Connecting),
            IceLinkState::Connected | IceLinkState::Completed => Some(Self::Connected),
            IceLinkState::Disconnected => Some(Self::Degraded),
            IceLinkState::Failed => Some(Self::Failed),
            IceLinkState::Closed => None,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Events emitted by a [`PeerTransport`] backend.
#[derive(Debug, Clone)]
pub enum PeerTransportEvent {
    /// Raw ICE connectivity changed.
    IceState(IceLinkState),
    /// The backend gathered a local candidate to signal to the peer.
    LocalCandidate(IceCandidate),
    /// The peer delivered a media stream.
    RemoteStream(Arc<MediaStream>),
}

/// Updates the controller reports to the session.
#[derive(Debug, Clone)]
pub enum TransportUpdate {
    /// Observable connectivity changed.
    Link(LinkState),
    /// A local candidate is ready to be signaled to the peer.
    LocalCandidate(IceCandidate),
    /// The first remote media stream is available.
    RemoteStream(Arc<MediaStream>),
}

/// The injected peer transport backend.
///
/// One backend exists per session; all negotiation state lives behind it.
/// Methods may suspend for arbitrarily long, so callers re-validate session
/// state after every await.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for sending.
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError>;

    /// Detach a local track by id.
    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError>;

    /// Produce a local offer; `ice_restart` requests fresh credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    /// Produce a local answer to the applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply the remote session description.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote connectivity candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attempt a lightweight renegotiation of connectivity.
    async fn restart_ice(&self) -> Result<(), TransportError>;

    /// Subscribe to backend events.
    fn events(&self) -> broadcast::Receiver<PeerTransportEvent>;

    /// Tear the backend down. Idempotent.
    async fn close(&self);
}

/// Creates one backend per session from the fixed configuration.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Construct a backend for a new session.
    async fn create(&self, config: &TransportConfig)
        -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Owns the peer transport for one session.
pub struct TransportController {
    call_id: CallId,
    backend: Arc<dyn PeerTransport>,
    policy: ReconnectPolicy,
    link: parking_lot::RwLock<LinkState>,
    restarts: Arc<AtomicU32>,
    closed: AtomicBool,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TransportController {
    /// Wrap a backend and start the connectivity monitor.
    ///
    /// Updates are tagged with the session's call id so the dispatch loop
    /// can guard against events from an already-dead controller.
    #[must_use]
    pub fn spawn(
        call_id: CallId,
        backend: Arc<dyn PeerTransport>,
        policy: ReconnectPolicy,
        updates: mpsc::UnboundedSender<(CallId, TransportUpdate)>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            call_id,
            backend: Arc::clone(&backend),
            policy,
            link: parking_lot::RwLock::new(LinkState::New),
            restarts: Arc::new(AtomicU32::new(0)),
            closed: AtomicBool::new(false),
            monitor: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(Self::monitor(
            call_id,
            backend,
            policy,
            Arc::clone(&controller.restarts),
            Arc::downgrade(&controller),
            updates,
        ));
        *controller.monitor.lock() = Some(task);
        controller
    }

    /// The session this controller belongs to.
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Current observable connectivity.
    #[must_use]
    pub fn link(&self) -> LinkState {
        *self.link.read()
    }

    /// ICE restarts attempted in the current degraded period.
    #[must_use]
    pub fn restarts_attempted(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    /// Attach every track of a local stream.
    pub async fn add_tracks(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            self.add_track(track).await?;
        }
        Ok(())
    }

    /// Attach one local track.
    pub async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.backend.add_track(track).await
    }

    /// Detach one local track by id.
    pub async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.backend.remove_track(track_id).await
    }

    /// Create a local offer.
    pub async fn create_offer(
        &self,
        ice_restart: bool,
    ) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        self.backend.create_offer(ice_restart).await
    }

    /// Create a local answer.
    pub async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        self.backend.create_answer().await
    }

    /// Apply the remote description.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.backend.set_remote_description(description).await
    }

    /// Apply a remote candidate.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.backend.add_ice_candidate(candidate).await
    }

    /// Stop the monitor and close the backend. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.backend.close().await;
        tracing::debug!(call_id = %self.call_id, "transport controller closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Connectivity monitor: translates backend events and drives the
    /// bounded reconnect cycle.
    async fn monitor(
        call_id: CallId,
        backend: Arc<dyn PeerTransport>,
        policy: ReconnectPolicy,
        restarts: Arc<AtomicU32>,
        controller: std::sync::Weak<Self>,
        updates: mpsc::UnboundedSender<(CallId, TransportUpdate)>,
    ) {
        let mut events = backend.events();
        let mut retry_at: Option<Instant> = None;
        let mut remote_surfaced = false;

        let set_link = |state: LinkState| {
            if let Some(controller) = controller.upgrade() {
                *controller.link.write() = state;
            }
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PeerTransportEvent::IceState(ice)) => {
                        let Some(link) = LinkState::from_ice(ice) else {
                            continue;
                        };
                        match link {
                            LinkState::Connected => {
                                if restarts.swap(0, Ordering::AcqRel) > 0 {
                                    tracing::info!(call_id = %call_id, "link recovered after restart");
                                }
                                retry_at = None;
                                set_link(link);
                                let _ = updates.send((call_id, TransportUpdate::Link(link)));
                            }
                            LinkState::Degraded => {
                                set_link(link);
                                let _ = updates.send((call_id, TransportUpdate::Link(link)));
                                if retry_at.is_none() {
                                    retry_at = Some(Instant::now() + policy.delay);
                                }
                            }
                            LinkState::Failed => {
                                set_link(link);
                                let _ = updates.send((call_id, TransportUpdate::Link(link)));
                                tracing::warn!(call_id = %call_id, "transport link failed");
                                return;
                            }
                            LinkState::New | LinkState::Connecting => {
                                set_link(link);
                                let _ = updates.send((call_id, TransportUpdate::Link(link)));
                            }
                        }
                    }
                    Ok(PeerTransportEvent::LocalCandidate(candidate)) => {
                        let _ = updates.send((call_id, TransportUpdate::LocalCandidate(candidate)));
                    }
                    Ok(PeerTransportEvent::RemoteStream(stream)) => {
                        if remote_surfaced {
                            tracing::debug!(call_id = %call_id, "ignoring additional remote stream");
                            continue;
                        }
                        remote_surfaced = true;
                        let _ = updates.send((call_id, TransportUpdate::RemoteStream(stream)));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(call_id = %call_id, skipped, "transport events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                        if retry_at.is_some() => {
                    // Still degraded after the wait: either restart or give up.
                    let attempts = restarts.load(Ordering::Acquire);
                    if !policy.allows_restart(attempts) {
                        set_link(LinkState::Failed);
                        let _ = updates.send((call_id, TransportUpdate::Link(LinkState::Failed)));
                        tracing::warn!(
                            call_id = %call_id,
                            attempts,
                            "reconnect attempts exhausted"
                        );
                        return;
                    }
                    restarts.fetch_add(1, Ordering::AcqRel);
                    tracing::info!(
                        call_id = %call_id,
                        attempt = attempts + 1,
                        max = policy.max_restarts,
                        "attempting ice restart"
                    );
                    if let Err(error) = backend.restart_ice().await {
                        tracing::warn!(call_id = %call_id, %error, "ice restart failed");
                    }
                    retry_at = Some(Instant::now() + policy.delay);
                }
            }
        }
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
    }
}

// Controllers are shared between the facade, the dispatch loop, and timers.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TransportController>();
    assert_send_sync::<TransportConfig>();
};
