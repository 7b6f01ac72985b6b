//! Local media acquisition
//!
//! A [`MediaStream`] is an ordered list of shared [`MediaTrack`]s. Tracks are
//! reference counted so the call state, the peer session and the UI can all
//! hold the same track; enabling, disabling or stopping it is visible to
//! every holder.
//!
//! Device access goes through the [`MediaDevices`] platform trait. The
//! [`MediaAcquirer`] turns a "voice or video" decision into concrete
//! constraints, using *ideal* resolution and frame rate so the platform can
//! fall back to whatever profile the camera supports.

use crate::types::{MediaConstraints, VideoConstraints};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device is in use by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Exact constraint could not be met
    #[error("Constraint not satisfied: {0}")]
    ConstraintNotSatisfied(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
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

/// Track lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadyState {
    /// Producing media
    Live,
    /// Stopped; never restarts
    Ended,
}

/// Settings the platform actually granted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSettings {
    /// Width in pixels (video)
    pub width: Option<u32>,
    /// Height in pixels (video)
    pub height: Option<u32>,
    /// Frames per second (video)
    pub frame_rate: Option<u32>,
}

/// A single audio or video track
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    device_id: Option<String>,
    settings: TrackSettings,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(
        kind: TrackKind,
        label: impl Into<String>,
        device_id: Option<String>,
        settings: TrackSettings,
    ) -> Self {
        Self {
            id: format!("{}-{}", kind, Uuid::new_v4()),
            kind,
            label: label.into(),
            device_id,
            settings,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Human readable label (usually the device name)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Capture device, for local tracks
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Granted settings
    pub fn settings(&self) -> TrackSettings {
        self.settings
    }

    /// Whether the track is sending media (false when muted)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current lifecycle state
    pub fn ready_state(&self) -> ReadyState {
        if self.live.load(Ordering::SeqCst) {
            ReadyState::Live
        } else {
            ReadyState::Ended
        }
    }

    /// Whether the track still holds its device
    pub fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }

    /// Stop the track and release its device.
    ///
    /// Returns `true` if this call ended the track.
    pub fn stop(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::SeqCst);
        if was_live {
            tracing::trace!(track_id = %self.id, kind = %self.kind, "Track stopped");
        }
        was_live
    }
}

/// Media stream
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.tracks.len() == other.tracks.len()
            && self
                .tracks
                .iter()
                .zip(&other.tracks)
                .all(|(a, b)| a.id() == b.id())
    }
}

impl MediaStream {
    /// Create a stream with a fresh identifier
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self::with_id(format!("stream-{}", Uuid::new_v4()), tracks)
    }

    /// Create a stream with a known identifier
    pub fn with_id(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks, in insertion order
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.video_tracks().next()
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Whether any track is still live
    pub fn has_live_tracks(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Copy of this stream with the first track of `new_track`'s kind
    /// replaced. Returns the new stream and the track it displaced.
    #[must_use]
    pub fn with_replaced_track(
        &self,
        new_track: Arc<MediaTrack>,
    ) -> (Self, Option<Arc<MediaTrack>>) {
        let mut tracks = self.tracks.clone();
        let old = match tracks.iter().position(|t| t.kind() == new_track.kind()) {
            Some(index) => Some(std::mem::replace(&mut tracks[index], new_track)),
            None => {
                tracks.push(new_track);
                None
            }
        };
        (Self::with_id(self.id.clone(), tracks), old)
    }
}

/// Kind of capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
}

/// Capture device description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier
    pub device_id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Device name
    pub label: String,
}

impl DeviceInfo {
    /// Microphone description
    pub fn audio_input(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::AudioInput,
            label: label.into(),
        }
    }

    /// Camera description
    pub fn video_input(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::VideoInput,
            label: label.into(),
        }
    }
}

/// Platform device access
///
/// Implement this for the capture stack of the host platform.
/// [`crate::simulated::SimulatedDevices`] is an in-process implementation.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// List capture devices
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    /// Open a stream satisfying `constraints`
    ///
    /// # Errors
    ///
    /// Returns error if permission is denied, no matching device exists, or
    /// the device is busy.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;
}

/// Requests local capture streams for calls
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    video: VideoConstraints,
}

impl MediaAcquirer {
    /// Create an acquirer with the given ideal video constraints
    pub fn new(devices: Arc<dyn MediaDevices>, video: VideoConstraints) -> Self {
        Self { devices, video }
    }

    /// Request a microphone stream, plus a camera when `want_video`
    ///
    /// # Errors
    ///
    /// Returns the platform's [`MediaError`] unchanged.
    pub async fn get_local_media(&self, want_video: bool) -> Result<MediaStream, MediaError> {
        let constraints = if want_video {
            MediaConstraints::video_call(self.video.clone())
        } else {
            MediaConstraints::audio_only()
        };
        tracing::debug!(video = want_video, "Requesting local media");

        let stream = self.devices.get_user_media(&constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Local media request failed");
            e
        })?;

        tracing::debug!(
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "Local media acquired"
        );
        Ok(stream)
    }

    /// List cameras in platform order
    pub async fn enumerate_video_inputs(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        let devices = self.devices.enumerate_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect())
    }

    /// Open a video-only stream from one specific camera
    pub async fn get_video_from_device(&self, device_id: &str) -> Result<MediaStream, MediaError> {
        let constraints = MediaConstraints::video_only(self.video.on_device(device_id));
        self.devices.get_user_media(&constraints).await
    }
}
