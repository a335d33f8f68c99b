//! Shared doubles for integration tests: an in-memory signaling router,
//! a scripted media source, and a recording transport backend.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_core::{
    CallConfig, CallService, IceCandidate, IceLinkState, InboundSignal, MediaError, MediaProfile,
    MediaSource, MediaStream, MediaTrack, PeerTransport, PeerTransportEvent,
    PeerTransportFactory, SessionDescription, SignalMessage, SignalingChannel, SignalingError,
    StreamOrigin, TrackKind, TransportConfig, TransportError, UserId, VideoPreset,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// In-memory stand-in for the signaling server.
///
/// Addressed messages go to their `to` peer; messages without an addressee
/// (`call_disconnected`) are relayed to every other registered peer, the way
/// the server would fan them out.
pub struct SignalRouter {
    peers: Mutex<Vec<(UserId, mpsc::UnboundedSender<InboundSignal<UserId>>)>>,
    log: Mutex<Vec<(UserId, SignalMessage<UserId>)>>,
}

impl SignalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Register a peer and hand back its channel endpoint.
    pub fn register(self: &Arc<Self>, name: &str) -> Arc<MemoryChannel> {
        let user = UserId::new(name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().push((user.clone(), tx));
        Arc::new(MemoryChannel {
            router: Arc::clone(self),
            local: user,
            inbound: tokio::sync::Mutex::new(rx),
        })
    }

    fn route(&self, from: &UserId, message: SignalMessage<UserId>) {
        self.log.lock().push((from.clone(), message.clone()));
        let peers = self.peers.lock();
        match message.to() {
            Some(to) => {
                if let Some((_, tx)) = peers.iter().find(|(peer, _)| peer == to) {
                    let _ = tx.send(InboundSignal {
                        from: from.clone(),
                        message,
                    });
                }
            }
            None => {
                for (peer, tx) in peers.iter() {
                    if peer != from {
                        let _ = tx.send(InboundSignal {
                            from: from.clone(),
                            message: message.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Simulate a server-originated message delivered to one peer.
    pub fn push_to(&self, to: &str, from: &str, message: SignalMessage<UserId>) {
        let to = UserId::new(to);
        let peers = self.peers.lock();
        if let Some((_, tx)) = peers.iter().find(|(peer, _)| *peer == to) {
            let _ = tx.send(InboundSignal {
                from: UserId::new(from),
                message,
            });
        }
    }

    /// Every message routed so far, as (sender, message) pairs.
    pub fn log(&self) -> Vec<(UserId, SignalMessage<UserId>)> {
        self.log.lock().clone()
    }

    /// Wire tags of every routed message, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.log
            .lock()
            .iter()
            .map(|(_, message)| message.message_type())
            .collect()
    }

    /// How many routed messages carry the given wire tag.
    pub fn count_kind(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

/// One peer's endpoint on the [`SignalRouter`].
pub struct MemoryChannel {
    router: Arc<SignalRouter>,
    local: UserId,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal<UserId>>>,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    type PeerId = UserId;
    type Error = SignalingError;

    async fn send(&self, message: SignalMessage<UserId>) -> Result<(), SignalingError> {
        self.router.route(&self.local, message);
        Ok(())
    }

    async fn next_message(&self) -> Result<InboundSignal<UserId>, SignalingError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::ChannelClosed)
    }
}

/// Scripted capture device source.
pub struct MockMedia {
    deny: AtomicBool,
    hold: AtomicBool,
    gate: Semaphore,
    acquisitions: AtomicU32,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
            acquisitions: AtomicU32::new(0),
        })
    }

    /// Make every subsequent acquisition fail like a denied permission prompt.
    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Park subsequent acquisitions, like a permission prompt left open.
    pub fn hold_acquisitions(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Let one parked acquisition proceed and stop holding new ones.
    pub fn release_acquisitions(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, profile: &MediaProfile) -> Result<Arc<MediaStream>, MediaError> {
        if self.hold.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![Arc::new(MediaTrack::new(TrackKind::Audio))];
        if profile.video.is_some() {
            tracks.push(Arc::new(MediaTrack::new(TrackKind::Video)));
        }
        Ok(Arc::new(MediaStream::new(StreamOrigin::Local, tracks)))
    }

    async fn acquire_video_track(
        &self,
        _preset: &VideoPreset,
    ) -> Result<Arc<MediaTrack>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        Ok(Arc::new(MediaTrack::new(TrackKind::Video)))
    }
}

/// Recording transport backend with scripted events.
pub struct MockTransport {
    events: broadcast::Sender<PeerTransportEvent>,
    pub applied_candidates: Mutex<Vec<String>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub added_tracks: Mutex<Vec<Arc<MediaTrack>>>,
    pub removed_track_ids: Mutex<Vec<String>>,
    /// Negotiation-relevant calls in invocation order.
    pub ops: Mutex<Vec<&'static str>>,
    pub restarts: AtomicU32,
    pub closed: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            applied_candidates: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            added_tracks: Mutex::new(Vec::new()),
            removed_track_ids: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
            restarts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn emit_ice(&self, state: IceLinkState) {
        let _ = self.events.send(PeerTransportEvent::IceState(state));
    }

    pub fn emit_local_candidate(&self, line: &str) {
        let _ = self
            .events
            .send(PeerTransportEvent::LocalCandidate(IceCandidate::new(line)));
    }

    pub fn emit_remote_stream(&self) -> Arc<MediaStream> {
        let stream = Arc::new(MediaStream::new(
            StreamOrigin::Remote,
            vec![Arc::new(MediaTrack::new(TrackKind::Audio))],
        ));
        let _ = self
            .events
            .send(PeerTransportEvent::RemoteStream(Arc::clone(&stream)));
        stream
    }

    pub fn candidate_lines(&self) -> Vec<String> {
        self.applied_candidates.lock().clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        self.ops.lock().push("add_track");
        self.added_tracks.lock().push(track);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        self.removed_track_ids.lock().push(track_id.to_string());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        if ice_restart {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ops.lock().push("create_answer");
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ops.lock().push("set_remote_description");
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.applied_candidates.lock().push(candidate.candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PeerTransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockTransport`]s and remembering them.
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(Vec::new()),
        })
    }

    /// The most recently created backend.
    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = MockTransport::new();
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// One participant: a service wired to the router plus its doubles.
pub struct Party {
    pub service: CallService<MemoryChannel>,
    pub media: Arc<MockMedia>,
    pub transports: Arc<MockTransportFactory>,
}

impl Party {
    /// The backend of this party's current (or last) session.
    pub fn transport(&self) -> Arc<MockTransport> {
        self.transports
            .latest()
            .unwrap_or_else(|| panic!("no transport created yet"))
    }
}

/// Build a participant registered on the router under `name`.
pub fn party(router: &Arc<SignalRouter>, name: &str) -> Party {
    party_with_config(router, name, CallConfig::default())
}

/// Build a participant with a custom configuration.
pub fn party_with_config(router: &Arc<SignalRouter>, name: &str, config: CallConfig) -> Party {
    let channel = router.register(name);
    let media = MockMedia::new();
    let transports = MockTransportFactory::new();
    let service = CallService::builder(UserId::new(name), channel)
        .with_config(config)
        .with_media_source(Arc::clone(&media) as Arc<dyn MediaSource>)
        .with_transport_factory(Arc::clone(&transports) as Arc<dyn PeerTransportFactory>)
        .build()
        .unwrap_or_else(|error| panic!("failed to build service: {error}"));
    Party {
        service,
        media,
        transports,
    }
}

/// Let every spawned task run until the system is quiescent.
pub async fn settle() {
    for _ in 0..40 {
        tokio::task::yield_now().await;
    }
}

/// Opt-in log output for debugging a test run; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
