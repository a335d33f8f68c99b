//! Device profiling and capture constraint presets
//!
//! Classifies the local device as constrained or standard from cheap
//! heuristics and derives fixed audio/video capture presets from the tier.
//! Profiling is pure and stateless: it is invoked fresh for every new
//! session, and all tier thresholds live in this module so they can be
//! tested in isolation.

use serde::{Deserialize, Serialize};

/// Devices at or below this much memory are classified as constrained.
const CONSTRAINED_MAX_MEMORY_GB: f32 = 2.0;

/// Devices at or below this many logical cores are classified as constrained.
const CONSTRAINED_MAX_CORES: u32 = 2;

/// Audio sample rate for constrained devices (Hz).
const AUDIO_SAMPLE_RATE_CONSTRAINED: u32 = 16_000;

/// Audio sample rate for standard devices (Hz).
const AUDIO_SAMPLE_RATE_STANDARD: u32 = 48_000;

/// Cheap heuristics describing the local device.
///
/// Collected once by the embedding application (approximate memory, logical
/// processor count, and whether the platform is a known low-end model) and
/// handed to the profiler at every session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignals {
    /// Approximate device memory in gigabytes.
    pub memory_gb: f32,
    /// Number of logical processors.
    pub logical_cores: u32,
    /// Platform matched a known low-end device signature.
    pub low_end_device: bool,
}

impl Default for DeviceSignals {
    fn default() -> Self {
        Self {
            memory_gb: 4.0,
            logical_cores: 4,
            low_end_device: false,
        }
    }
}

/// Device capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    /// Low memory, few cores, or a known low-end model.
    Constrained,
    /// Everything else.
    Standard,
}

/// Audio capture preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPreset {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Number of capture channels.
    pub channel_count: u8,
    /// Acoustic echo cancellation.
    pub echo_cancellation: bool,
    /// Noise suppression.
    pub noise_suppression: bool,
    /// Automatic gain control.
    pub auto_gain_control: bool,
}

/// Video capture preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPreset {
    /// Capture width in pixels.
    pub width: u32,
    /// Capture height in pixels.
    pub height: u32,
    /// Capture frame rate in frames per second.
    pub frame_rate: u32,
}

/// Capture constraints derived for one session.
///
/// Computed once per `start_call`/`accept_call` and stored on the session;
/// never silently re-derived mid-call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaProfile {
    /// The tier the device was classified into.
    pub tier: DeviceTier,
    /// Audio capture preset.
    pub audio: AudioPreset,
    /// Video capture preset; `None` for voice-only sessions.
    pub video: Option<VideoPreset>,
}

impl DeviceTier {
    /// Classify a device from its signals.
    #[must_use]
    pub fn classify(signals: &DeviceSignals) -> Self {
        if signals.low_end_device
            || signals.memory_gb <= CONSTRAINED_MAX_MEMORY_GB
            || signals.logical_cores <= CONSTRAINED_MAX_CORES
        {
            Self::Constrained
        } else {
            Self::Standard
        }
    }

    /// Audio preset for this tier.
    #[must_use]
    pub fn audio_preset(self) -> AudioPreset {
        AudioPreset {
            sample_rate: match self {
                Self::Constrained => AUDIO_SAMPLE_RATE_CONSTRAINED,
                Self::Standard => AUDIO_SAMPLE_RATE_STANDARD,
            },
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// Video preset for this tier.
    #[must_use]
    pub fn video_preset(self) -> VideoPreset {
        match self {
            Self::Constrained => VideoPreset {
                width: 640,
                height: 480,
                frame_rate: 15,
            },
            Self::Standard => VideoPreset {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
        }
    }
}

/// Derive the capture profile for a new session.
///
/// Pure and deterministic: the same signals always yield the same profile.
#[must_use]
pub fn profile_device(signals: &DeviceSignals, want_video: bool) -> MediaProfile {
    let tier = DeviceTier::classify(signals);
    MediaProfile {
        tier,
        audio: tier.audio_preset(),
        video: want_video.then(|| tier.video_preset()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn standard_signals() -> DeviceSignals {
        DeviceSignals {
            memory_gb: 8.0,
            logical_cores: 8,
            low_end_device: false,
        }
    }

    #[test]
    fn ample_device_is_standard() {
        assert_eq!(
            DeviceTier::classify(&standard_signals()),
            DeviceTier::Standard
        );
    }

    #[test]
    fn low_memory_is_constrained() {
        let signals = DeviceSignals {
            memory_gb: 2.0,
            ..standard_signals()
        };
        assert_eq!(DeviceTier::classify(&signals), DeviceTier::Constrained);
    }

    #[test]
    fn few_cores_is_constrained() {
        let signals = DeviceSignals {
            logical_cores: 2,
            ..standard_signals()
        };
        assert_eq!(DeviceTier::classify(&signals), DeviceTier::Constrained);
    }

    #[test]
    fn low_end_signature_overrides_ample_hardware() {
        let signals = DeviceSignals {
            low_end_device: true,
            ..standard_signals()
        };
        assert_eq!(DeviceTier::classify(&signals), DeviceTier::Constrained);
    }

    #[test]
    fn just_above_thresholds_is_standard() {
        let signals = DeviceSignals {
            memory_gb: 2.5,
            logical_cores: 3,
            low_end_device: false,
        };
        assert_eq!(DeviceTier::classify(&signals), DeviceTier::Standard);
    }

    #[test]
    fn standard_profile_presets() {
        let profile = profile_device(&standard_signals(), true);
        assert_eq!(profile.tier, DeviceTier::Standard);
        assert_eq!(profile.audio.sample_rate, 48_000);
        assert_eq!(profile.audio.channel_count, 1);
        assert!(profile.audio.echo_cancellation);

        let video = profile.video.unwrap();
        assert_eq!((video.width, video.height), (1280, 720));
        assert_eq!(video.frame_rate, 30);
    }

    #[test]
    fn constrained_profile_presets() {
        let signals = DeviceSignals {
            memory_gb: 1.0,
            logical_cores: 2,
            low_end_device: false,
        };
        let profile = profile_device(&signals, true);
        assert_eq!(profile.tier, DeviceTier::Constrained);
        assert_eq!(profile.audio.sample_rate, 16_000);

        let video = profile.video.unwrap();
        assert_eq!((video.width, video.height), (640, 480));
        assert_eq!(video.frame_rate, 15);
    }

    #[test]
    fn voice_only_profile_has_no_video_preset() {
        let profile = profile_device(&standard_signals(), false);
        assert!(profile.video.is_none());
        assert!(profile.audio.noise_suppression);
    }

    #[test]
    fn profiling_is_deterministic() {
        let signals = standard_signals();
        assert_eq!(
            profile_device(&signals, true),
            profile_device(&signals, true)
        );
    }
}
