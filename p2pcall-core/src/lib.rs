//! p2pcall - peer-to-peer voice and video call sessions
//!
//! This library manages the lifecycle of one real-time call between two
//! users. It features:
//!
//! - **Explicit state machine**: idle, outgoing, incoming and connected
//!   phases with guarded transitions and a synchronous snapshot accessor
//! - **Pluggable transport**: the peer-connection constructor is located by
//!   an ordered list of resolution strategies, with a single dynamic-load
//!   fallback
//! - **Typed event bus**: ordered, synchronous delivery to any number of UI
//!   surfaces
//! - **Media controls**: mute, camera toggle, camera switching by track
//!   replacement, and call-duration accounting
//! - **Deterministic teardown**: every terminal transition releases the
//!   peer session and all local tracks exactly once
//!
//! # Examples
//!
//! ```rust,no_run
//! use p2pcall_core::prelude::*;
//!
//! # async fn example() -> Result<(), CallError> {
//! let manager = CallManager::new();
//!
//! manager.on(CallEventKind::CallAccepted, |event| {
//!     println!("connected: {}", event.call_id());
//! });
//!
//! let call_id = manager
//!     .initiate_call(CallUser::new("user-42", "Ada"), CallType::Video)
//!     .await?;
//!
//! manager.toggle_mute();
//! manager.end_call().await?;
//! # let _ = call_id;
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
#![allow(clippy::module_name_repetitions)]

/// Call identifiers, participants and the state snapshot
pub mod types;

/// Local media streams, tracks and device access
pub mod media;

/// Call events and the event bus
pub mod events;

/// Peer session and factory traits
pub mod peer;

/// Peer constructor resolution
pub mod transport;

/// Signaling protocol and channel
pub mod signaling;

/// In-process devices, peers and loaders
pub mod simulated;

/// Call state machine
pub mod call;

/// Mute, camera and duration controls
pub mod controls;

/// Peer sessions over the webrtc crate
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_peer;

pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
pub use events::{
    CallEvent, CallEventKind, EndReason, EventBus, EventHandler, FailureKind, SubscriptionId,
};
pub use media::{
    DeviceInfo, DeviceKind, MediaAcquirer, MediaDevices, MediaError, MediaStream, MediaTrack,
    ReadyState, TrackKind, TrackSettings,
};
pub use peer::{
    PeerError, PeerEvent, PeerEventSender, PeerFactory, PeerOptions, PeerSession, SignalPayload,
};
pub use signaling::{
    RemoteAnswer, SignalingChannel, SignalingError, SignalingMessage, SimulatedSignaling,
};
pub use transport::{
    ResolveStrategy, TransportError, TransportExport, TransportLoader, TransportResolver,
};
pub use types::{
    CallId, CallPhase, CallState, CallType, CallUser, MediaConstraints, VideoConstraints,
};

#[cfg(feature = "webrtc-transport")]
pub use webrtc_peer::{WebRtcPeer, WebRtcPeerFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
    pub use crate::events::{CallEvent, CallEventKind, EndReason, FailureKind};
    pub use crate::media::{MediaDevices, MediaStream, MediaTrack, TrackKind};
    pub use crate::signaling::{SignalingChannel, SignalingMessage};
    pub use crate::transport::{TransportExport, TransportResolver};
    pub use crate::types::{CallId, CallPhase, CallState, CallType, CallUser};
}
