//! Local media acquisition and live stream handles
//!
//! This module defines the seam between the session core and the platform
//! media engine. The engine is injected as a [`MediaSource`]; the core owns
//! the resulting [`MediaStream`]/[`MediaTrack`] handles and every rule about
//! their lifetime: tracks are exclusively owned by the active session and
//! are stopped (released, not paused) the instant the session goes
//! terminal.
//!
//! Handles carry the observable track state (live, enabled) so UI
//! collaborators can render and tests can assert release without a real
//! device behind them.

use crate::profile::{MediaProfile, VideoPreset};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media acquisition errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user refused device access.
    #[error("Permission to access capture devices was denied")]
    PermissionDenied,

    /// No usable device found, or the device is held by another process.
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Microphone audio.
    Audio,
    /// Camera video.
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Where a stream came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Captured on this device.
    Local,
    /// Delivered by the peer transport.
    Remote,
}

/// Handle to a single live media track.
///
/// The flags are the authoritative view the core exposes: `enabled` is the
/// mute toggle, `live` flips to `false` exactly once when the track is
/// stopped and the underlying device is released.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    /// Create a live, enabled track handle.
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{kind}-{}", Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Unique track id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video.
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track is producing media (not muted).
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Mute or unmute the track.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the track still holds its device.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track and release the underlying device. Idempotent.
    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// A group of tracks rendered together (one local, one remote per session).
///
/// `output_muted` is a rendering policy, not a capture control: the local
/// stream is always constructed output-muted so the user never hears their
/// own microphone leg played back.
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    origin: StreamOrigin,
    output_muted: bool,
    tracks: parking_lot::RwLock<Vec<Arc<MediaTrack>>>,
}

impl MediaStream {
    /// Create a stream around an initial set of tracks.
    ///
    /// Local streams are output-muted by policy; remote streams are not.
    #[must_use]
    pub fn new(origin: StreamOrigin, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: format!("stream-{}", Uuid::new_v4()),
            origin,
            output_muted: matches!(origin, StreamOrigin::Local),
            tracks: parking_lot::RwLock::new(tracks),
        }
    }

    /// Unique stream id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local or remote.
    #[must_use]
    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    /// Whether the renderer must keep this stream's audio output silent.
    #[must_use]
    pub fn output_muted(&self) -> bool {
        self.output_muted
    }

    /// Snapshot of the current tracks.
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    /// The first track of the given kind, if present.
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    /// Add a track (mid-call video upgrade).
    pub fn add_track(&self, track: Arc<MediaTrack>) {
        self.tracks.write().push(track);
    }

    /// Remove a track by id, returning it if it was present.
    pub fn remove_track(&self, track_id: &str) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        let idx = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(idx))
    }

    /// Stop every track in the stream. Idempotent.
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    /// Whether any track is still live.
    #[must_use]
    pub fn any_live(&self) -> bool {
        self.tracks.read().iter().any(|t| t.is_live())
    }
}

/// Platform media engine seam: turns capture presets into live tracks.
///
/// Acquisition may suspend for arbitrarily long (permission prompts, device
/// warm-up); the caller re-validates session state when it resumes.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a local stream matching the profile (microphone, plus camera
    /// when the profile carries a video preset).
    async fn acquire(&self, profile: &MediaProfile) -> Result<Arc<MediaStream>, MediaError>;

    /// Acquire a single camera track for a mid-call voice→video upgrade.
    async fn acquire_video_track(
        &self,
        preset: &VideoPreset,
    ) -> Result<Arc<MediaTrack>, MediaError>;
}

// Handles are shared across the facade, the controller, and UI tasks.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<MediaTrack>();
    assert_send_sync::<MediaStream>();
};
