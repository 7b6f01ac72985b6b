//! Call types and data structures

use crate::media::MediaStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
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

/// Identity of the remote participant
///
/// Immutable for the duration of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallUser {
    /// Stable user identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Reference to the user's avatar image, if any
    pub avatar_ref: Option<String>,
}

impl CallUser {
    /// Create a user without an avatar
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_ref: None,
        }
    }

    /// Attach an avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and video
    Video,
}

impl CallType {
    /// Whether this call type requests a camera
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Call phase derived from the [`CallState`] flags
///
/// ```text
///   Idle ──initiate──▶ Outgoing ──answer/connect──▶ Connected
///     │                                                 │
///     └──incoming──▶ Incoming ──accept──────────────────┤
///                                                       ▼
///   Idle ◀──────────── end / reject / error ─────────────
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    Idle,
    /// We are calling someone and waiting for the answer
    Outgoing,
    /// Someone is calling us
    Incoming,
    /// Call is active
    Connected,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Outgoing => write!(f, "outgoing"),
            Self::Incoming => write!(f, "incoming"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Video capture constraints
///
/// Width, height and frame rate are *ideal* values: the platform may
/// substitute the closest profile it supports. `device_id`, when set, is
/// an exact requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    /// Ideal width in pixels
    pub ideal_width: u32,
    /// Ideal height in pixels
    pub ideal_height: u32,
    /// Ideal frames per second
    pub ideal_frame_rate: u32,
    /// Exact capture device, if any
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            ideal_frame_rate: 30,
            device_id: None,
        }
    }
}

impl VideoConstraints {
    /// Same ideals, pinned to one device
    #[must_use]
    pub fn on_device(&self, device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..self.clone()
        }
    }
}

/// Media constraints for a local stream request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a microphone
    pub audio: bool,
    /// Request a camera with these constraints
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio-only request
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Audio and video request
    pub fn video_call(video: VideoConstraints) -> Self {
        Self {
            audio: true,
            video: Some(video),
        }
    }

    /// Video-only request (used when swapping cameras)
    pub fn video_only(video: VideoConstraints) -> Self {
        Self {
            audio: false,
            video: Some(video),
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Authoritative call snapshot
///
/// Only the call manager writes this; everyone else receives clones through
/// [`crate::CallManager::get_call_state`]. A clone is a snapshot: re-fetch
/// it after every event instead of patching a cached copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CallState {
    /// Call is connected
    pub is_in_call: bool,
    /// A remote party is ringing us
    pub is_incoming: bool,
    /// We are ringing a remote party
    pub is_outgoing: bool,
    /// Voice or video, once a call exists
    pub call_type: Option<CallType>,
    /// The other participant
    pub remote_user: Option<CallUser>,
    /// Local capture stream used for rendering
    pub local_stream: Option<MediaStream>,
    /// Remote stream used for rendering
    pub remote_stream: Option<MediaStream>,
    /// Microphone muted
    pub is_muted: bool,
    /// Camera sending
    pub is_video_enabled: bool,
    /// When the call started
    pub call_start_time: Option<DateTime<Utc>>,
    /// Identifier of the current call
    pub call_id: Option<CallId>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            is_in_call: false,
            is_incoming: false,
            is_outgoing: false,
            call_type: None,
            remote_user: None,
            local_stream: None,
            remote_stream: None,
            is_muted: false,
            is_video_enabled: true,
            call_start_time: None,
            call_id: None,
        }
    }
}

impl CallState {
    /// Current phase
    pub fn phase(&self) -> CallPhase {
        if self.is_in_call {
            CallPhase::Connected
        } else if self.is_incoming {
            CallPhase::Incoming
        } else if self.is_outgoing {
            CallPhase::Outgoing
        } else {
            CallPhase::Idle
        }
    }

    /// Whether every field holds its idle default
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_media_constraints() {
        let audio = MediaConstraints::audio_only();
        assert!(audio.has_audio());
        assert!(!audio.has_video());

        let video = MediaConstraints::video_call(VideoConstraints::default());
        assert!(video.has_audio());
        assert!(video.has_video());

        let camera = MediaConstraints::video_only(VideoConstraints::default().on_device("cam-2"));
        assert!(!camera.has_audio());
        assert_eq!(
            camera.video.unwrap().device_id.as_deref(),
            Some("cam-2")
        );
    }

    #[test]
    fn test_idle_defaults() {
        let state = CallState::default();
        assert!(state.is_idle());
        assert_eq!(state.phase(), CallPhase::Idle);
        assert!(state.is_video_enabled);
        assert!(!state.is_muted);
    }

    #[test]
    fn test_phase_precedence() {
        let mut state = CallState {
            is_outgoing: true,
            ..CallState::default()
        };
        assert_eq!(state.phase(), CallPhase::Outgoing);

        state.is_outgoing = false;
        state.is_in_call = true;
        assert_eq!(state.phase(), CallPhase::Connected);
        assert!(!state.is_idle());
    }

    #[test]
    fn test_call_type_serialization() {
        let json = serde_json::to_string(&CallType::Video).unwrap();
        assert_eq!(json, "\"video\"");
        let parsed: CallType = serde_json::from_str("\"voice\"").unwrap();
        assert_eq!(parsed, CallType::Voice);
    }

    #[test]
    fn test_video_constraints_partial_config() {
        let parsed: VideoConstraints = serde_json::from_str(r#"{"ideal_width": 640}"#).unwrap();
        assert_eq!(parsed.ideal_width, 640);
        assert_eq!(parsed.ideal_height, 720);
        assert_eq!(parsed.device_id, None);
    }
}
