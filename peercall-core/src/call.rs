//! Call session state machine.
//!
//! [`CallStateMachine`] owns at most one [`ActiveSession`] at a time and is the
//! only place call state changes. Everything that can touch a session funnels
//! through it: facade operations (start, accept, decline, end, mute, switch),
//! inbound signaling messages, transport link updates, and timer inputs. The
//! service layer serializes the inbound sources into a single dispatch loop,
//! so handlers here never race each other; facade operations run on caller
//! tasks and synchronize through the session lock.
//!
//! Locking discipline: the session lock is never held across a media or
//! negotiation await. Long operations run in phases that re-validate the
//! `(call_id, state)` pair after every await, so a session torn down mid-flight
//! is observed and the stale continuation backs out.

use crate::candidates::CandidateBuffer;
use crate::identity::PeerIdentity;
use crate::media::{MediaSource, MediaStream, MediaTrack, TrackKind};
use crate::profile::{profile_device, MediaProfile};
use crate::service::CallConfig;
use crate::signaling::{
    DisconnectStatus, InboundSignal, PresenceStatus, SignalMessage, SignalingChannel,
    SignalingClient,
};
use crate::transport::{
    LinkState, PeerTransportFactory, TransportController, TransportError, TransportUpdate,
};
use crate::types::{
    CallEvent, CallId, CallNotice, CallRole, CallSnapshot, CallState, EndReason, IceCandidate,
    SessionDescription,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// Capacity of the broadcast channel carrying [`CallEvent`]s.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors returned by call operations.
#[derive(Error, Debug)]
pub enum CallError {
    /// A session already exists; only one call may be active at a time.
    #[error("A call is already in progress")]
    Busy,

    /// The operation needs an active session and there is none.
    #[error("No active call")]
    NoActiveCall,

    /// The operation is not valid in the session's current state.
    #[error("Cannot {op} while call is {state}")]
    InvalidState {
        /// Operation that was attempted.
        op: &'static str,
        /// State the session was in.
        state: CallState,
    },

    /// Local media capture failed.
    #[error("Media error: {0}")]
    Media(#[from] crate::media::MediaError),

    /// Peer transport operation failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Timer-driven inputs fed back into the machine through the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallInput {
    /// The ring timer elapsed without the call being answered.
    RingTimeout {
        /// Session the timer was armed for.
        call_id: CallId,
    },
    /// Periodic tick while connected, used to refresh the duration snapshot.
    Tick {
        /// Session the ticker belongs to.
        call_id: CallId,
    },
}

/// Receiver halves of the machine's feedback channels, consumed by the
/// service dispatch loop.
pub(crate) struct MachineHandles {
    /// Timer inputs (ring timeout, duration ticks).
    pub inputs: mpsc::UnboundedReceiver<CallInput>,
    /// Link and stream updates from transport controllers.
    pub updates: mpsc::UnboundedReceiver<(CallId, TransportUpdate)>,
}

/// How a terminating session says goodbye to the remote side.
enum Farewell {
    /// Nothing to send; the remote side already knows or never heard of us.
    Silent,
    /// Normal hangup notification.
    Hangup,
    /// Abnormal termination with a reason carried on the wire.
    Disconnected {
        /// Human-readable reason shown on the remote side.
        reason: String,
    },
}

/// Mutable state of a single call from first signal to teardown.
struct ActiveSession<I: PeerIdentity> {
    id: CallId,
    peer: I,
    role: CallRole,
    video: bool,
    state: CallState,
    /// Device profile captured once at start/accept; never re-derived mid-call.
    profile: Option<MediaProfile>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    local: Option<Arc<MediaStream>>,
    remote: Option<Arc<MediaStream>>,
    controller: Option<Arc<TransportController>>,
    /// Remote candidates held until the remote description is applied.
    buffer: CandidateBuffer,
    /// Offer that arrived while still ringing, applied on accept.
    pending_offer: Option<SessionDescription>,
    /// Once true, further candidates bypass the buffer.
    remote_description_applied: bool,
    accepted: bool,
    /// Local tracks are attached to the transport; an inbound offer may be
    /// answered directly instead of waiting for the accept continuation.
    media_ready: bool,
    audio_muted: bool,
    video_muted: bool,
    ring_timer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl<I: PeerIdentity> ActiveSession<I> {
    fn new(id: CallId, peer: I, role: CallRole, video: bool, state: CallState) -> Self {
        Self {
            id,
            peer,
            role,
            video,
            state,
            profile: None,
            started_at: Utc::now(),
            connected_at: None,
            local: None,
            remote: None,
            controller: None,
            buffer: CandidateBuffer::new(),
            pending_offer: None,
            remote_description_applied: false,
            accepted: false,
            media_ready: false,
            audio_muted: false,
            video_muted: false,
            ring_timer: None,
            ticker: None,
        }
    }

    fn matches(&self, call_id: CallId) -> bool {
        self.id == call_id
    }

    fn duration_secs(&self) -> Option<u64> {
        let connected = self.connected_at?;
        u64::try_from((Utc::now() - connected).num_seconds()).ok()
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_ring_timer();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl<I: PeerIdentity> Drop for ActiveSession<I> {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Session slot plus the last user-facing error, which survives the reset to
/// idle so the UI can still show why the previous call went away.
struct Inner<I: PeerIdentity> {
    session: Option<ActiveSession<I>>,
    last_error: Option<String>,
}

/// State machine driving a single peer-to-peer call session.
///
/// Constructed by the service builder; all I/O seams (signaling channel,
/// media source, transport factory) are injected, so the machine itself is
/// deterministic and testable without real devices or sockets.
pub struct CallStateMachine<C: SignalingChannel> {
    local_user: C::PeerId,
    config: CallConfig,
    signaling: Arc<SignalingClient<C>>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn PeerTransportFactory>,
    inner: RwLock<Inner<C::PeerId>>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    events_tx: broadcast::Sender<CallEvent<C::PeerId>>,
    inputs_tx: mpsc::UnboundedSender<CallInput>,
    updates_tx: mpsc::UnboundedSender<(CallId, TransportUpdate)>,
}

impl<C: SignalingChannel> CallStateMachine<C> {
    /// Creates the machine and the receiver halves the dispatch loop drains.
    pub(crate) fn new(
        local_user: C::PeerId,
        config: CallConfig,
        signaling: Arc<SignalingClient<C>>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn PeerTransportFactory>,
    ) -> (Arc<Self>, MachineHandles) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(CallSnapshot::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let machine = Arc::new(Self {
            local_user,
            config,
            signaling,
            media,
            transports,
            inner: RwLock::new(Inner {
                session: None,
                last_error: None,
            }),
            snapshot_tx,
            events_tx,
            inputs_tx,
            updates_tx,
        });
        (
            machine,
            MachineHandles {
                inputs: inputs_rx,
                updates: updates_rx,
            },
        )
    }

    // ---- observation --------------------------------------------------

    /// Current snapshot of the session for UI rendering.
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch channel that yields a fresh [`CallSnapshot`] on every change.
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribes to call events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<C::PeerId>> {
        self.events_tx.subscribe()
    }

    /// Handle to the local capture stream, if one is live.
    pub async fn local_stream(&self) -> Option<Arc<MediaStream>> {
        let inner = self.inner.read().await;
        inner.session.as_ref()?.local.clone()
    }

    /// Handle to the remote stream, once the transport has surfaced one.
    pub async fn remote_stream(&self) -> Option<Arc<MediaStream>> {
        let inner = self.inner.read().await;
        inner.session.as_ref()?.remote.clone()
    }

    fn publish(&self, inner: &Inner<C::PeerId>) {
        let snapshot = match &inner.session {
            Some(s) => CallSnapshot {
                state: s.state,
                is_video_call: s.video,
                error: inner.last_error.clone(),
                duration: s.connected_at.map(|connected| Utc::now() - connected),
                is_audio_muted: s.audio_muted,
                is_video_muted: s.video_muted,
            },
            None => CallSnapshot {
                error: inner.last_error.clone(),
                ..CallSnapshot::idle()
            },
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn emit(&self, event: CallEvent<C::PeerId>) {
        let _ = self.events_tx.send(event);
    }

    /// Applies a state transition if the edge is legal, emitting the change.
    /// Illegal edges are refused and logged, leaving the session untouched.
    fn transition(&self, session: &mut ActiveSession<C::PeerId>, to: CallState) -> bool {
        if !session.state.can_transition(to) {
            tracing::warn!(
                call_id = %session.id,
                from = %session.state,
                to = %to,
                "refusing invalid call state transition"
            );
            return false;
        }
        tracing::info!(call_id = %session.id, from = %session.state, to = %to, "call state change");
        session.state = to;
        self.emit(CallEvent::StateChanged {
            call_id: session.id,
            state: to,
        });
        true
    }

    // ---- outgoing calls -----------------------------------------------

    /// Starts an outgoing call to `peer`.
    ///
    /// Validates the idle requirement and transitions to `calling`
    /// synchronously; media capture, transport setup, and the offer exchange
    /// continue on a background task. Setup failures surface through the
    /// snapshot and the event stream rather than this return value.
    #[tracing::instrument(skip_all, fields(peer = %peer, video))]
    pub async fn start_call(
        self: &Arc<Self>,
        peer: C::PeerId,
        video: bool,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        {
            let mut inner = self.inner.write().await;
            if inner.session.is_some() {
                return Err(CallError::Busy);
            }
            inner.last_error = None;
            let mut session = ActiveSession::new(
                call_id,
                peer.clone(),
                CallRole::Caller,
                video,
                CallState::Calling,
            );
            session.profile = Some(profile_device(&self.config.device, video));
            tracing::info!(call_id = %call_id, "starting outgoing call");
            inner.session = Some(session);
            self.publish(&inner);
        }
        self.emit(CallEvent::StateChanged {
            call_id,
            state: CallState::Calling,
        });
        // Armed before setup begins, so a hung negotiation still times out.
        self.arm_ring_timer(call_id).await;

        let machine = Arc::clone(self);
        tokio::spawn(async move {
            machine.run_caller_setup(call_id, peer, video).await;
        });
        Ok(call_id)
    }

    /// Caller-side setup: capture, transport, `call_request` plus offer.
    async fn run_caller_setup(self: Arc<Self>, call_id: CallId, peer: C::PeerId, video: bool) {
        let Some(local) = self.acquire_local_media(call_id, false).await else {
            return;
        };
        let Some(controller) = self.setup_controller(call_id, false).await else {
            return;
        };
        if let Err(error) = controller.add_tracks(&local).await {
            self.fail_call(call_id, error.to_string(), false).await;
            return;
        }

        if !self.session_alive(call_id).await {
            return;
        }
        self.signaling
            .send(SignalMessage::CallRequest {
                to: peer.clone(),
                is_video: video,
                call_id,
            })
            .await;

        let offer = match controller.create_offer(false).await {
            Ok(offer) => offer,
            Err(error) => {
                self.fail_call(call_id, error.to_string(), true).await;
                return;
            }
        };
        self.signaling
            .send(SignalMessage::Offer {
                sdp: offer.sdp,
                to: peer,
                is_video: video,
                call_id,
            })
            .await;
    }

    // ---- incoming calls -----------------------------------------------

    /// Handles an inbound `call_request`. A second concurrent request is
    /// declined immediately and reported as a missed call.
    async fn handle_call_request(self: &Arc<Self>, from: C::PeerId, call_id: CallId, video: bool) {
        {
            let mut inner = self.inner.write().await;
            if let Some(session) = &inner.session {
                if session.matches(call_id) {
                    tracing::debug!(call_id = %call_id, "duplicate call_request ignored");
                } else {
                    tracing::info!(
                        call_id = %call_id,
                        busy_with = %session.id,
                        from = %from,
                        "declining call_request while busy"
                    );
                    drop(inner);
                    self.signaling
                        .send(SignalMessage::CallDecline {
                            to: from.clone(),
                            call_id,
                        })
                        .await;
                    self.emit(CallEvent::MissedCall { call_id, from });
                }
                return;
            }
            inner.last_error = None;
            let session = ActiveSession::new(
                call_id,
                from.clone(),
                CallRole::Callee,
                video,
                CallState::Ringing,
            );
            tracing::info!(call_id = %call_id, from = %from, video, "incoming call ringing");
            inner.session = Some(session);
            self.publish(&inner);
        }
        self.emit(CallEvent::StateChanged {
            call_id,
            state: CallState::Ringing,
        });
        self.arm_ring_timer(call_id).await;

        // Transport is created up front so an offer arriving right behind the
        // request has somewhere to land once the user accepts.
        if self.setup_controller(call_id, true).await.is_none() {
            return;
        }
        self.emit(CallEvent::IncomingCall {
            call_id,
            from,
            video,
        });
    }

    /// Accepts the currently ringing call.
    ///
    /// Transitions to `connecting` synchronously; capture and the answer
    /// exchange continue on a background task.
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let call_id = {
            let mut inner = self.inner.write().await;
            let Some(session) = inner.session.as_mut() else {
                return Err(CallError::NoActiveCall);
            };
            if session.state != CallState::Ringing {
                return Err(CallError::InvalidState {
                    op: "accept",
                    state: session.state,
                });
            }
            session.accepted = true;
            session.profile = Some(profile_device(&self.config.device, session.video));
            session.cancel_ring_timer();
            let id = session.id;
            self.transition(session, CallState::Connecting);
            self.publish(&inner);
            id
        };

        let machine = Arc::clone(self);
        tokio::spawn(async move {
            machine.run_callee_accept(call_id).await;
        });
        Ok(())
    }

    /// Callee-side setup after accept: capture, attach, `call_accept`, and
    /// the answer for any offer that arrived while ringing.
    async fn run_callee_accept(self: Arc<Self>, call_id: CallId) {
        let Some(local) = self.acquire_local_media(call_id, true).await else {
            return;
        };
        let (peer, controller) = {
            let inner = self.inner.read().await;
            let Some(session) = inner.session.as_ref().filter(|s| s.matches(call_id)) else {
                return;
            };
            let Some(controller) = session.controller.clone() else {
                drop(inner);
                self.fail_call(call_id, "transport unavailable".to_string(), true)
                    .await;
                return;
            };
            (session.peer.clone(), controller)
        };
        if let Err(error) = controller.add_tracks(&local).await {
            self.fail_call(call_id, error.to_string(), true).await;
            return;
        }

        // Tracks are attached; from here an inbound offer may be answered
        // directly. Taking the stored offer in the same critical section
        // keeps the answer single-shot.
        let pending_offer = {
            let mut inner = self.inner.write().await;
            let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id)) else {
                return;
            };
            session.media_ready = true;
            session.pending_offer.take()
        };

        self.signaling
            .send(SignalMessage::CallAccept { to: peer, call_id })
            .await;

        if let Some(offer) = pending_offer {
            self.answer_offer(call_id, offer).await;
        }
    }

    /// Declines the currently ringing call.
    #[tracing::instrument(skip(self))]
    pub async fn decline_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (call_id, peer) = {
            let inner = self.inner.read().await;
            let Some(session) = inner.session.as_ref() else {
                return Err(CallError::NoActiveCall);
            };
            if session.state != CallState::Ringing {
                return Err(CallError::InvalidState {
                    op: "decline",
                    state: session.state,
                });
            }
            (session.id, session.peer.clone())
        };
        self.signaling
            .send(SignalMessage::CallDecline { to: peer, call_id })
            .await;
        self.end_session(call_id, EndReason::Declined, Farewell::Silent, None)
            .await;
        Ok(())
    }

    // ---- hangup and teardown ------------------------------------------

    /// Ends the active call, or does nothing if there is none.
    ///
    /// Universal cancellation: valid in every state, idempotent, and sends at
    /// most one `call_end` per session.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(self: &Arc<Self>) -> Result<(), CallError> {
        let call_id = {
            let inner = self.inner.read().await;
            match inner.session.as_ref() {
                Some(session) => session.id,
                None => {
                    tracing::debug!("end_call with no active session; nothing to do");
                    return Ok(());
                }
            }
        };
        self.end_session(call_id, EndReason::Hangup, Farewell::Hangup, None)
            .await;
        Ok(())
    }

    /// Tears down the session identified by `call_id`.
    ///
    /// Cancels timers, transitions to the terminal state, stops tracks,
    /// closes the transport, optionally notifies the peer, and only then
    /// publishes the reset to idle. A mismatched or absent session makes this
    /// a no-op, which is what makes hangup paths idempotent.
    async fn end_session(
        &self,
        call_id: CallId,
        reason: EndReason,
        farewell: Farewell,
        error: Option<String>,
    ) {
        let terminal = if reason.is_failure() {
            CallState::Failed
        } else {
            CallState::Ended
        };

        let mut session = {
            let mut inner = self.inner.write().await;
            if !inner.session.as_ref().is_some_and(|s| s.matches(call_id)) {
                tracing::debug!(call_id = %call_id, "end_session for inactive call ignored");
                return;
            }
            if let Some(message) = error {
                inner.last_error = Some(message);
            }
            // Taking the session out means a second teardown finds nothing.
            let Some(mut session) = inner.session.take() else {
                return;
            };
            session.cancel_timers();
            self.transition(&mut session, terminal);
            inner.session = Some(session);
            self.publish(&inner);
            match inner.session.take() {
                Some(session) => session,
                None => return,
            }
        };

        let duration_secs = session.duration_secs();
        match farewell {
            Farewell::Silent => {}
            Farewell::Hangup => {
                self.signaling
                    .send(SignalMessage::CallEnd {
                        to: session.peer.clone(),
                        call_id,
                    })
                    .await;
            }
            Farewell::Disconnected {
                reason: wire_reason,
            } => {
                let status = if reason.is_failure() {
                    DisconnectStatus::Failed
                } else {
                    DisconnectStatus::Ended
                };
                self.signaling
                    .send(SignalMessage::CallDisconnected {
                        from: self.local_user.clone(),
                        call_id,
                        reason: wire_reason,
                        status,
                        duration: duration_secs,
                    })
                    .await;
            }
        }

        if let Some(local) = session.local.take() {
            local.stop_all();
        }
        if let Some(remote) = session.remote.take() {
            remote.stop_all();
        }
        if let Some(controller) = session.controller.take() {
            controller.close().await;
        }
        session.buffer.clear();

        {
            let inner = self.inner.write().await;
            self.publish(&inner);
        }
        let session_secs = (Utc::now() - session.started_at).num_seconds();
        tracing::info!(
            call_id = %call_id,
            %reason,
            duration_secs = duration_secs.unwrap_or(0),
            session_secs,
            "call ended"
        );
        self.emit(CallEvent::Ended {
            call_id,
            reason,
            duration_secs,
        });
    }

    /// Fails the session with a user-facing message. `notify_peer` sends a
    /// `call_disconnected` so the other side is not left waiting.
    async fn fail_call(&self, call_id: CallId, message: String, notify_peer: bool) {
        tracing::warn!(call_id = %call_id, error = %message, "call failed");
        let farewell = if notify_peer {
            Farewell::Disconnected {
                reason: message.clone(),
            }
        } else {
            Farewell::Silent
        };
        self.end_session(call_id, EndReason::Failed, farewell, Some(message))
            .await;
    }

    // ---- in-call controls ---------------------------------------------

    /// Toggles the local audio track and returns the new muted state.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_audio_mute(&self) -> Result<bool, CallError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.session.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let track = session
            .local
            .as_ref()
            .and_then(|local| local.track(TrackKind::Audio))
            .ok_or(CallError::InvalidState {
                op: "mute audio",
                state: session.state,
            })?;
        let was_enabled = track.is_enabled();
        track.set_enabled(!was_enabled);
        session.audio_muted = was_enabled;
        let muted = session.audio_muted;
        tracing::debug!(call_id = %session.id, muted, "audio mute toggled");
        self.publish(&inner);
        Ok(muted)
    }

    /// Toggles the local video track and returns the new muted state.
    ///
    /// Errors on voice-only sessions, which carry no video track to toggle.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_video_mute(&self) -> Result<bool, CallError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.session.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let track = session
            .local
            .as_ref()
            .and_then(|local| local.track(TrackKind::Video))
            .ok_or(CallError::InvalidState {
                op: "mute video",
                state: session.state,
            })?;
        let was_enabled = track.is_enabled();
        track.set_enabled(!was_enabled);
        session.video_muted = was_enabled;
        let muted = session.video_muted;
        tracing::debug!(call_id = %session.id, muted, "video mute toggled");
        self.publish(&inner);
        Ok(muted)
    }

    /// Switches the session between voice and video, returning `true` when
    /// the session is a video call afterwards.
    ///
    /// Upgrading acquires a camera track using the preset of the tier
    /// captured at session start; downgrading stops and detaches the local
    /// video track. No renegotiation message is sent: the transport adjusts
    /// track flow in place.
    #[tracing::instrument(skip(self))]
    pub async fn switch_call_type(self: &Arc<Self>) -> Result<bool, CallError> {
        enum Switch {
            Upgrade {
                preset: crate::profile::VideoPreset,
                local: Arc<MediaStream>,
                controller: Option<Arc<TransportController>>,
            },
            Downgrade {
                track: Arc<MediaTrack>,
                local: Arc<MediaStream>,
                controller: Option<Arc<TransportController>>,
            },
        }

        let (call_id, action) = {
            let mut inner = self.inner.write().await;
            let Some(session) = inner.session.as_mut() else {
                return Err(CallError::NoActiveCall);
            };
            if session.state.is_terminal() || session.state == CallState::Idle {
                return Err(CallError::InvalidState {
                    op: "switch call type",
                    state: session.state,
                });
            }
            let Some(local) = session.local.clone() else {
                return Err(CallError::InvalidState {
                    op: "switch call type",
                    state: session.state,
                });
            };
            let action = if session.video {
                let Some(track) = local.track(TrackKind::Video) else {
                    return Err(CallError::InvalidState {
                        op: "switch call type",
                        state: session.state,
                    });
                };
                session.video = false;
                session.video_muted = false;
                tracing::info!(call_id = %session.id, "switching to voice call");
                Switch::Downgrade {
                    track,
                    local,
                    controller: session.controller.clone(),
                }
            } else {
                let Some(profile) = session.profile.as_ref() else {
                    return Err(CallError::InvalidState {
                        op: "switch call type",
                        state: session.state,
                    });
                };
                let preset = profile.tier.video_preset();
                session.video = true;
                session.video_muted = false;
                tracing::info!(call_id = %session.id, "switching to video call");
                Switch::Upgrade {
                    preset,
                    local,
                    controller: session.controller.clone(),
                }
            };
            let id = session.id;
            self.publish(&inner);
            (id, action)
        };

        match action {
            Switch::Downgrade {
                track,
                local,
                controller,
            } => {
                track.stop();
                local.remove_track(track.id());
                if let Some(controller) = controller {
                    if let Err(error) = controller.remove_track(track.id()).await {
                        tracing::warn!(call_id = %call_id, error = %error, "failed to detach video track");
                    }
                }
                Ok(false)
            }
            Switch::Upgrade {
                preset,
                local,
                controller,
            } => {
                let track = match self.media.acquire_video_track(&preset).await {
                    Ok(track) => track,
                    Err(error) => {
                        let mut inner = self.inner.write().await;
                        if let Some(session) =
                            inner.session.as_mut().filter(|s| s.matches(call_id))
                        {
                            session.video = false;
                            self.publish(&inner);
                        }
                        return Err(error.into());
                    }
                };
                {
                    let inner = self.inner.read().await;
                    let alive = inner
                        .session
                        .as_ref()
                        .is_some_and(|s| s.matches(call_id) && s.video);
                    if !alive {
                        drop(inner);
                        track.stop();
                        return Err(CallError::NoActiveCall);
                    }
                }
                local.add_track(Arc::clone(&track));
                if let Some(controller) = controller {
                    if let Err(error) = controller.add_track(track).await {
                        tracing::warn!(call_id = %call_id, error = %error, "failed to attach video track");
                    }
                }
                Ok(true)
            }
        }
    }

    // ---- signaling handlers -------------------------------------------

    /// Routes one inbound signaling message to its handler.
    ///
    /// Messages carrying a `call_id` that does not match the active session
    /// are dropped here or in the handlers; `call_request` is the only
    /// message allowed to create a session.
    pub(crate) async fn handle_signal(self: &Arc<Self>, inbound: InboundSignal<C::PeerId>) {
        let InboundSignal { from, message } = inbound;
        tracing::trace!(from = %from, kind = message.message_type(), "inbound signal");
        match message {
            SignalMessage::CallRequest {
                is_video, call_id, ..
            } => self.handle_call_request(from, call_id, is_video).await,
            SignalMessage::Offer {
                sdp,
                is_video,
                call_id,
                ..
            } => self.handle_offer(call_id, sdp, is_video).await,
            SignalMessage::Answer { sdp, call_id, .. } => self.handle_answer(call_id, sdp).await,
            SignalMessage::IceCandidate {
                candidate, call_id, ..
            } => self.handle_candidate(call_id, candidate).await,
            SignalMessage::CallAccept { call_id, .. } => self.handle_call_accept(call_id).await,
            SignalMessage::CallDecline { call_id, .. } => {
                self.end_session(call_id, EndReason::Declined, Farewell::Silent, None)
                    .await;
            }
            SignalMessage::CallEnd { call_id, .. } => {
                self.end_session(call_id, EndReason::RemoteHangup, Farewell::Silent, None)
                    .await;
            }
            SignalMessage::CallTimeout { call_id, .. } => {
                self.end_session(call_id, EndReason::NoAnswer, Farewell::Silent, None)
                    .await;
            }
            SignalMessage::CallWaiting { message, status } => {
                self.handle_call_waiting(message, status).await;
            }
            SignalMessage::CallDisconnected {
                call_id,
                reason,
                status,
                duration,
                ..
            } => {
                self.handle_call_disconnected(call_id, reason, status, duration)
                    .await;
            }
        }
    }

    /// Inbound offer: stored while ringing or while accept-side capture is
    /// still in flight, answered once local tracks are attached.
    async fn handle_offer(self: &Arc<Self>, call_id: CallId, sdp: String, video: bool) {
        let ready = {
            let mut inner = self.inner.write().await;
            let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id)) else {
                tracing::debug!(call_id = %call_id, "offer for inactive call dropped");
                return;
            };
            match session.state {
                CallState::Ringing => {
                    session.video = video;
                    session.pending_offer = Some(SessionDescription::offer(sdp.clone()));
                    self.publish(&inner);
                    false
                }
                CallState::Connecting
                    if session.accepted && !session.remote_description_applied =>
                {
                    if session.media_ready {
                        session.pending_offer = None;
                        true
                    } else {
                        // Capture is still suspended; the accept continuation
                        // answers once tracks are attached.
                        session.pending_offer = Some(SessionDescription::offer(sdp.clone()));
                        false
                    }
                }
                state => {
                    tracing::debug!(call_id = %call_id, %state, "offer dropped in current state");
                    false
                }
            }
        };
        if ready {
            self.answer_offer(call_id, SessionDescription::offer(sdp))
                .await;
        }
    }

    /// Applies a remote offer, flushes buffered candidates, and sends back
    /// the answer.
    async fn answer_offer(self: &Arc<Self>, call_id: CallId, offer: SessionDescription) {
        let Some((controller, peer)) = self.session_parts(call_id).await else {
            return;
        };
        if let Err(error) = controller.set_remote_description(offer).await {
            self.fail_call(call_id, error.to_string(), true).await;
            return;
        }
        self.flush_candidates(call_id, &controller).await;

        let answer = match controller.create_answer().await {
            Ok(answer) => answer,
            Err(error) => {
                self.fail_call(call_id, error.to_string(), true).await;
                return;
            }
        };
        self.signaling
            .send(SignalMessage::Answer {
                sdp: answer.sdp,
                to: peer,
                call_id,
            })
            .await;
    }

    /// Inbound answer on the caller side: `calling` becomes `connecting`.
    async fn handle_answer(self: &Arc<Self>, call_id: CallId, sdp: String) {
        {
            let mut inner = self.inner.write().await;
            let Some(session) = inner
                .session
                .as_mut()
                .filter(|s| s.matches(call_id) && s.state == CallState::Calling)
            else {
                tracing::debug!(call_id = %call_id, "answer for inactive call dropped");
                return;
            };
            session.cancel_ring_timer();
            self.transition(session, CallState::Connecting);
            self.publish(&inner);
        }
        let Some((controller, _)) = self.session_parts(call_id).await else {
            return;
        };
        if let Err(error) = controller
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.fail_call(call_id, error.to_string(), true).await;
            return;
        }
        self.flush_candidates(call_id, &controller).await;
    }

    /// Inbound remote candidate: buffered until the remote description is
    /// applied, then handed straight to the transport. Arrival order is
    /// preserved across the buffered/direct boundary.
    async fn handle_candidate(self: &Arc<Self>, call_id: CallId, candidate: IceCandidate) {
        let direct = {
            let mut inner = self.inner.write().await;
            let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id)) else {
                tracing::debug!(call_id = %call_id, "candidate for inactive call dropped");
                return;
            };
            if session.state.is_terminal() {
                return;
            }
            if session.remote_description_applied {
                session.controller.clone()
            } else {
                session.buffer.push(candidate.clone());
                tracing::trace!(
                    call_id = %call_id,
                    buffered = session.buffer.len(),
                    "candidate buffered until remote description"
                );
                None
            }
        };
        if let Some(controller) = direct {
            if let Err(error) = controller.add_ice_candidate(candidate).await {
                tracing::warn!(call_id = %call_id, error = %error, "failed to add ICE candidate");
            }
        }
    }

    /// Drains the candidate buffer in arrival order. The applied flag is only
    /// set once the buffer is observed empty under the lock, so candidates
    /// that slip in during a drain batch still go through the buffer first.
    async fn flush_candidates(&self, call_id: CallId, controller: &Arc<TransportController>) {
        loop {
            let batch = {
                let mut inner = self.inner.write().await;
                let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id)) else {
                    return;
                };
                if session.buffer.is_empty() {
                    session.remote_description_applied = true;
                    return;
                }
                session.buffer.drain()
            };
            tracing::debug!(call_id = %call_id, count = batch.len(), "flushing buffered candidates");
            for pending in batch {
                if let Err(error) = controller.add_ice_candidate(pending.candidate).await {
                    tracing::warn!(call_id = %call_id, error = %error, "failed to add buffered candidate");
                }
            }
        }
    }

    /// Inbound `call_accept`: the callee picked up; the answer will follow.
    async fn handle_call_accept(&self, call_id: CallId) {
        let mut inner = self.inner.write().await;
        let Some(session) = inner
            .session
            .as_mut()
            .filter(|s| s.matches(call_id) && s.state == CallState::Calling)
        else {
            tracing::debug!(call_id = %call_id, "call_accept for inactive call dropped");
            return;
        };
        tracing::debug!(call_id = %call_id, "peer accepted; awaiting answer");
        session.cancel_ring_timer();
    }

    /// Presence hint while dialing; outside `calling` it is stale noise.
    async fn handle_call_waiting(&self, message: String, status: PresenceStatus) {
        let relevant = {
            let inner = self.inner.read().await;
            inner
                .session
                .as_ref()
                .is_some_and(|s| s.state == CallState::Calling)
        };
        if !relevant {
            tracing::debug!("call_waiting outside of dialing dropped");
            return;
        }
        self.emit(CallEvent::Notice(CallNotice::PeerPresence {
            message,
            online: status == PresenceStatus::Online,
        }));
    }

    /// Remote side reports the session gone, by failure or by hangup on
    /// another path.
    async fn handle_call_disconnected(
        &self,
        call_id: CallId,
        reason: String,
        status: DisconnectStatus,
        duration: Option<u64>,
    ) {
        let failed = status == DisconnectStatus::Failed;
        {
            let inner = self.inner.read().await;
            if !inner.session.as_ref().is_some_and(|s| s.matches(call_id)) {
                tracing::debug!(call_id = %call_id, "call_disconnected for inactive call dropped");
                return;
            }
        }
        self.emit(CallEvent::Notice(CallNotice::PeerDisconnected {
            reason: reason.clone(),
            failed,
            duration_secs: duration,
        }));
        let (end_reason, error) = if failed {
            (EndReason::Failed, Some(reason))
        } else {
            (EndReason::RemoteHangup, None)
        };
        self.end_session(call_id, end_reason, Farewell::Silent, error)
            .await;
    }

    // ---- transport updates --------------------------------------------

    /// Applies one link or stream update from the session's transport.
    pub(crate) async fn handle_transport_update(
        self: &Arc<Self>,
        call_id: CallId,
        update: TransportUpdate,
    ) {
        match update {
            TransportUpdate::Link(LinkState::Connected) => {
                let became_connected = {
                    let mut inner = self.inner.write().await;
                    let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id))
                    else {
                        return;
                    };
                    match session.state {
                        CallState::Connecting => {
                            self.transition(session, CallState::Connected);
                            if session.connected_at.is_none() {
                                session.connected_at = Some(Utc::now());
                                session.ticker = Some(self.spawn_ticker(call_id));
                            }
                            self.publish(&inner);
                            true
                        }
                        CallState::Connected => {
                            tracing::debug!(call_id = %call_id, "link reconnected");
                            false
                        }
                        state => {
                            tracing::debug!(
                                call_id = %call_id,
                                %state,
                                "link connected in unexpected state"
                            );
                            false
                        }
                    }
                };
                if became_connected {
                    tracing::info!(call_id = %call_id, "call connected");
                }
            }
            TransportUpdate::Link(LinkState::Degraded) => {
                let active = {
                    let inner = self.inner.read().await;
                    inner.session.as_ref().is_some_and(|s| s.matches(call_id))
                };
                if active {
                    tracing::warn!(call_id = %call_id, "link degraded; transport is retrying");
                }
            }
            TransportUpdate::Link(LinkState::Failed) => {
                let connected = {
                    let inner = self.inner.read().await;
                    match inner.session.as_ref().filter(|s| s.matches(call_id)) {
                        Some(session) => session.connected_at.is_some(),
                        None => return,
                    }
                };
                let message = if connected {
                    "Connection lost".to_string()
                } else {
                    "Could not establish connection".to_string()
                };
                tracing::warn!(call_id = %call_id, "transport failed beyond recovery");
                self.end_session(
                    call_id,
                    EndReason::Failed,
                    Farewell::Disconnected {
                        reason: message.clone(),
                    },
                    Some(message),
                )
                .await;
            }
            TransportUpdate::Link(state) => {
                tracing::trace!(call_id = %call_id, %state, "link state update");
            }
            TransportUpdate::LocalCandidate(candidate) => {
                let peer = {
                    let inner = self.inner.read().await;
                    match inner.session.as_ref().filter(|s| s.matches(call_id)) {
                        Some(session) => session.peer.clone(),
                        None => return,
                    }
                };
                self.signaling
                    .send(SignalMessage::IceCandidate {
                        candidate,
                        to: peer,
                        call_id,
                    })
                    .await;
            }
            TransportUpdate::RemoteStream(stream) => {
                let event = {
                    let mut inner = self.inner.write().await;
                    let Some(session) = inner.session.as_mut().filter(|s| s.matches(call_id))
                    else {
                        return;
                    };
                    if session.remote.is_some() {
                        None
                    } else {
                        session.remote = Some(Arc::clone(&stream));
                        Some(CallEvent::RemoteStreamReady { call_id, stream })
                    }
                };
                if let Some(event) = event {
                    tracing::info!(call_id = %call_id, "remote stream ready");
                    self.emit(event);
                }
            }
        }
    }

    // ---- timer inputs --------------------------------------------------

    /// Applies one timer input.
    pub(crate) async fn handle_input(self: &Arc<Self>, input: CallInput) {
        match input {
            CallInput::RingTimeout { call_id } => self.handle_ring_timeout(call_id).await,
            CallInput::Tick { call_id } => {
                let inner = self.inner.write().await;
                if inner.session.as_ref().is_some_and(|s| s.matches(call_id)) {
                    self.publish(&inner);
                }
            }
        }
    }

    /// Nobody answered within the ring window. The caller notifies the peer
    /// with `call_timeout`; the callee quietly declines its missed ring.
    async fn handle_ring_timeout(&self, call_id: CallId) {
        let (role, peer) = {
            let inner = self.inner.read().await;
            let Some(session) = inner.session.as_ref().filter(|s| {
                s.matches(call_id) && matches!(s.state, CallState::Calling | CallState::Ringing)
            }) else {
                tracing::debug!(call_id = %call_id, "stale ring timeout ignored");
                return;
            };
            (session.role, session.peer.clone())
        };
        tracing::info!(call_id = %call_id, ?role, "call timed out unanswered");
        let error = match role {
            CallRole::Caller => {
                self.signaling
                    .send(SignalMessage::CallTimeout {
                        to: peer,
                        call_id,
                    })
                    .await;
                Some("No answer".to_string())
            }
            CallRole::Callee => {
                self.signaling
                    .send(SignalMessage::CallDecline {
                        to: peer.clone(),
                        call_id,
                    })
                    .await;
                self.emit(CallEvent::MissedCall {
                    call_id,
                    from: peer,
                });
                None
            }
        };
        self.end_session(call_id, EndReason::NoAnswer, Farewell::Silent, error)
            .await;
    }

    // ---- setup helpers -------------------------------------------------

    /// Captures local media for the session and stores it, backing out if
    /// the session died while the devices were being opened.
    async fn acquire_local_media(
        &self,
        call_id: CallId,
        notify_peer_on_failure: bool,
    ) -> Option<Arc<MediaStream>> {
        let profile = {
            let inner = self.inner.read().await;
            let session = inner.session.as_ref().filter(|s| s.matches(call_id))?;
            session.profile?
        };
        let local = match self.media.acquire(&profile).await {
            Ok(local) => local,
            Err(error) => {
                self.fail_call(call_id, error.to_string(), notify_peer_on_failure)
                    .await;
                return None;
            }
        };
        let stored = {
            let mut inner = self.inner.write().await;
            match inner.session.as_mut().filter(|s| s.matches(call_id)) {
                Some(session) => {
                    session.local = Some(Arc::clone(&local));
                    true
                }
                None => false,
            }
        };
        if !stored {
            tracing::debug!(call_id = %call_id, "session ended during media capture");
            local.stop_all();
            return None;
        }
        Some(local)
    }

    /// Creates the transport controller for the session and stores it.
    async fn setup_controller(
        &self,
        call_id: CallId,
        notify_peer_on_failure: bool,
    ) -> Option<Arc<TransportController>> {
        let backend = match self.transports.create(&self.config.transport).await {
            Ok(backend) => backend,
            Err(error) => {
                self.fail_call(call_id, error.to_string(), notify_peer_on_failure)
                    .await;
                return None;
            }
        };
        let controller = TransportController::spawn(
            call_id,
            backend,
            self.config.reconnect,
            self.updates_tx.clone(),
        );
        let stored = {
            let mut inner = self.inner.write().await;
            match inner.session.as_mut().filter(|s| s.matches(call_id)) {
                Some(session) => {
                    session.controller = Some(Arc::clone(&controller));
                    true
                }
                None => false,
            }
        };
        if !stored {
            tracing::debug!(call_id = %call_id, "session ended during transport setup");
            controller.close().await;
            return None;
        }
        Some(controller)
    }

    /// Controller and peer of an active session, if still alive.
    async fn session_parts(
        &self,
        call_id: CallId,
    ) -> Option<(Arc<TransportController>, C::PeerId)> {
        let inner = self.inner.read().await;
        let session = inner.session.as_ref().filter(|s| s.matches(call_id))?;
        let controller = session.controller.clone()?;
        Some((controller, session.peer.clone()))
    }

    async fn session_alive(&self, call_id: CallId) -> bool {
        let inner = self.inner.read().await;
        inner.session.as_ref().is_some_and(|s| s.matches(call_id))
    }

    /// Arms the one ring timer a session gets. Re-arming is a no-op.
    async fn arm_ring_timer(&self, call_id: CallId) {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.session.as_mut().filter(|s| {
            s.matches(call_id) && matches!(s.state, CallState::Calling | CallState::Ringing)
        }) else {
            return;
        };
        if session.ring_timer.is_some() {
            return;
        }
        let inputs = self.inputs_tx.clone();
        let timeout = self.config.ring_timeout;
        session.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inputs.send(CallInput::RingTimeout { call_id });
        }));
    }

    fn spawn_ticker(&self, call_id: CallId) -> JoinHandle<()> {
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if inputs.send(CallInput::Tick { call_id }).is_err() {
                    break;
                }
            }
        })
    }
}
