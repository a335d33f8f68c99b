//! Peercall - peer-to-peer call session management
//!
//! This library drives real-time audio/video call sessions over a pluggable
//! signaling channel and peer transport. It features:
//!
//! - **Single-Session State Machine**: One active call, edge-checked
//!   transitions, stale messages guarded by call ID
//! - **Pluggable Seams**: Bring your own signaling channel, capture devices,
//!   and transport backend through three traits
//! - **Candidate Buffering**: Remote ICE candidates are held in arrival order
//!   until the remote description is applied
//! - **Bounded Recovery**: Degraded links trigger spaced ICE restarts with a
//!   hard cap before the call fails
//! - **Device Profiles**: Capture presets picked once per call from device
//!   tier signals
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CallService, UserId};
//! use std::sync::Arc;
//!
//! # use async_trait::async_trait;
//! # use peercall_core::{InboundSignal, SignalMessage, SignalingChannel, SignalingError};
//! # struct MyChannel;
//! # #[async_trait]
//! # impl SignalingChannel for MyChannel {
//! #     type PeerId = UserId;
//! #     type Error = SignalingError;
//! #     async fn send(&self, _message: SignalMessage<UserId>) -> Result<(), SignalingError> {
//! #         Ok(())
//! #     }
//! #     async fn next_message(&self) -> Result<InboundSignal<UserId>, SignalingError> {
//! #         std::future::pending().await
//! #     }
//! # }
//! # async fn example(
//! #     media: Arc<dyn peercall_core::MediaSource>,
//! #     transports: Arc<dyn peercall_core::PeerTransportFactory>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! // Wire the three seams into a service
//! let service = CallService::builder(UserId::new("alice"), Arc::new(MyChannel))
//!     .with_media_source(media)
//!     .with_transport_factory(transports)
//!     .build()?;
//!
//! // Ring bob with video
//! let call_id = service.start_call(UserId::new("bob"), true).await?;
//!
//! // Render state changes as they come
//! let mut snapshots = service.watch_snapshot();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow().clone();
//!     println!("call {call_id} is {}", snapshot.state);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Device tier classification and capture presets
pub mod profile;

/// Peer identity abstraction
pub mod identity;

/// Capture streams, tracks, and the media source seam
pub mod media;

/// Remote candidate buffering
pub mod candidates;

/// Signaling messages, channel seam, and client
pub mod signaling;

/// Peer transport seam and link supervision
pub mod transport;

/// Call session state machine
pub mod call;

/// Service facade and dispatch loop
pub mod service;

// Re-export main types at crate root
pub use call::{CallError, CallStateMachine};
pub use candidates::{CandidateBuffer, PendingCandidate};
pub use identity::{PeerIdentity, UserId};
pub use media::{MediaError, MediaSource, MediaStream, MediaTrack, StreamOrigin, TrackKind};
pub use profile::{
    profile_device, AudioPreset, DeviceSignals, DeviceTier, MediaProfile, VideoPreset,
};
pub use service::{
    CallConfig, CallService, CallServiceBuilder, ServiceError, DEFAULT_RING_TIMEOUT,
};
pub use signaling::{
    DisconnectStatus, InboundSignal, PresenceStatus, SignalMessage, SignalingChannel,
    SignalingClient, SignalingError, SignalingSubscription,
};
pub use transport::{
    BundlePolicy, IceLinkState, LinkState, PeerTransport, PeerTransportEvent,
    PeerTransportFactory, ReconnectPolicy, RelayServer, TransportConfig, TransportController,
    TransportError, TransportUpdate,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::CallError;
    pub use crate::identity::{PeerIdentity, UserId};
    pub use crate::media::{MediaSource, MediaStream, MediaTrack};
    pub use crate::service::{CallConfig, CallService, CallServiceBuilder, ServiceError};
    pub use crate::signaling::{InboundSignal, SignalMessage, SignalingChannel};
    pub use crate::transport::{PeerTransport, PeerTransportFactory, TransportConfig};
    pub use crate::types::{
        CallEvent, CallId, CallNotice, CallSnapshot, CallState, EndReason,
    };
}
