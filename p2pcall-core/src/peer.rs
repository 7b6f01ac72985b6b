//! Peer session abstraction
//!
//! A [`PeerSession`] wraps exactly one peer-to-peer connection. Sessions are
//! created by a [`PeerFactory`] (the "constructor" the transport resolver
//! locates) and report their lifecycle through an ordered channel of
//! [`PeerEvent`]s. The call manager consumes that channel one event at a
//! time, so delivery order is processing order.

use crate::media::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The connection could not be created
    #[error("Failed to create peer connection: {0}")]
    CreateFailed(String),

    /// The session has no outbound sender for this kind of track
    #[error("No outbound {0} track to replace")]
    NoSender(TrackKind),

    /// Track replacement failed
    #[error("Track replacement failed: {0}")]
    TrackReplacement(String),

    /// A remote signal could not be applied
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// The underlying transport failed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The session was already destroyed
    #[error("Peer session destroyed")]
    Destroyed,
}

/// Opaque session-description payload exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// SDP offer
    Offer {
        /// SDP content
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// SDP content
        sdp: String,
    },
    /// ICE candidate
    Candidate {
        /// Candidate line
        candidate: String,
        /// SDP media ID
        sdp_mid: Option<String>,
        /// SDP media line index
        sdp_mline_index: Option<u16>,
    },
}

impl SignalPayload {
    /// Short name for logging
    pub fn label(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

/// Peer session lifecycle event
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Outbound signaling payload for the remote peer
    Signal(SignalPayload),
    /// Remote media became available
    Stream(MediaStream),
    /// Transport handshake complete
    Connect,
    /// Transport failed
    Error(String),
    /// Transport closed
    Close,
}

/// Sending half of a session's event channel
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Session creation parameters
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Whether this side creates the offer
    pub initiator: bool,
    /// Local media to send
    pub local_stream: MediaStream,
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

/// One peer-to-peer connection
///
/// Owned exclusively by the call manager. Never reused after
/// [`PeerSession::destroy`].
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Session identifier
    fn id(&self) -> &str;

    /// Whether this side created the offer
    fn is_initiator(&self) -> bool;

    /// Feed a payload received from the remote peer
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not fit the session's negotiation state.
    async fn apply_remote_signal(&self, payload: SignalPayload) -> Result<(), PeerError>;

    /// Swap the outbound track of `kind` without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error if the session has no sender for `kind`.
    async fn replace_outbound_track(
        &self,
        kind: TrackKind,
        track: Arc<MediaTrack>,
    ) -> Result<(), PeerError>;

    /// Close the connection and stop the remote tracks this session owns.
    /// Idempotent.
    fn destroy(&self);

    /// Whether [`PeerSession::destroy`] has run
    fn is_destroyed(&self) -> bool;
}

/// Peer connection constructor
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Implementation name for logging
    fn name(&self) -> &str;

    /// Create a session that reports through `events`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created.
    async fn create(
        &self,
        options: PeerOptions,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, PeerError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_payload_wire_format() {
        let offer = SignalPayload::Offer {
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");

        let candidate: SignalPayload = serde_json::from_str(
            r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdp_mid":"0","sdp_mline_index":0}"#,
        )
        .unwrap();
        assert_eq!(candidate.label(), "candidate");
    }
}
