//! Peer sessions over the `webrtc` crate
//!
//! Each session owns one `RTCPeerConnection`. Local tracks are attached as
//! static-sample tracks (Opus for audio, VP8 for video); frames are written
//! by the platform capture pipeline, not here. Connection callbacks are
//! translated into [`PeerEvent`]s on the session's channel.

use crate::media::{MediaStream, MediaTrack, TrackKind, TrackSettings};
use crate::peer::{
    PeerError, PeerEvent, PeerEventSender, PeerFactory, PeerOptions, PeerSession, SignalPayload,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Event channel shared with the connection callbacks; closed on destroy
struct EventSink {
    sender: Mutex<Option<PeerEventSender>>,
}

impl EventSink {
    fn send(&self, event: PeerEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn local_track(track: &MediaTrack, stream_id: &str) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind()),
        track.id().to_owned(),
        stream_id.to_owned(),
    ))
}

/// Call-level event for a connection state, if any. `Disconnected` may
/// recover to `Connected`, so only `Failed` and `Closed` end the session.
fn event_for_state(state: RTCPeerConnectionState) -> Option<PeerEvent> {
    match state {
        RTCPeerConnectionState::Connected => Some(PeerEvent::Connect),
        RTCPeerConnectionState::Failed => Some(PeerEvent::Error("peer connection failed".into())),
        RTCPeerConnectionState::Closed => Some(PeerEvent::Close),
        RTCPeerConnectionState::Disconnected => {
            tracing::info!("Peer connection interrupted");
            None
        }
        _ => None,
    }
}

fn transport_err(context: &str, err: webrtc::Error) -> PeerError {
    PeerError::Transport(format!("{context}: {err}"))
}

/// Creates [`WebRtcPeer`] sessions
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    /// Factory using the given STUN/TURN URLs when a session does not
    /// specify its own
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn new_connection(&self, ice_servers: &[String]) -> Result<RTCPeerConnection, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::CreateFailed(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::CreateFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let urls = if ice_servers.is_empty() {
            self.ice_servers.clone()
        } else {
            ice_servers.to_vec()
        };
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map_err(|e| PeerError::CreateFailed(e.to_string()))
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    fn name(&self) -> &str {
        "webrtc"
    }

    async fn create(
        &self,
        options: PeerOptions,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, PeerError> {
        let pc = Arc::new(self.new_connection(&options.ice_servers).await?);
        let peer = Arc::new(WebRtcPeer {
            id: format!("webrtc-{}", Uuid::new_v4()),
            initiator: options.initiator,
            stream_id: options.local_stream.id().to_owned(),
            pc,
            sink: Arc::new(EventSink {
                sender: Mutex::new(Some(events)),
            }),
            senders: Mutex::new(HashMap::new()),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            destroyed: AtomicBool::new(false),
        });
        peer.register_callbacks();

        if let Err(e) = peer.start(&options.local_stream).await {
            peer.destroyed.store(true, Ordering::SeqCst);
            peer.sink.close();
            if let Err(close_err) = peer.pc.close().await {
                tracing::warn!(session = %peer.id, error = %close_err, "Error closing half-built peer connection");
            }
            return Err(e);
        }

        tracing::debug!(session = %peer.id, initiator = options.initiator, "WebRTC peer created");
        Ok(peer)
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcPeer {
    id: String,
    initiator: bool,
    stream_id: String,
    pc: Arc<RTCPeerConnection>,
    sink: Arc<EventSink>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<MediaTrack>>>>,
    destroyed: AtomicBool,
}

impl WebRtcPeer {
    fn register_callbacks(&self) {
        let candidate_sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = candidate_sink.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => sink.send(PeerEvent::Signal(SignalPayload::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize ICE candidate"),
                    }
                })
            }));

        let track_sink = self.sink.clone();
        let track_store = self.remote_tracks.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = Arc::new(MediaTrack::new(
                    kind,
                    format!("remote {kind}"),
                    None,
                    TrackSettings::default(),
                ));
                let tracks = {
                    let mut store = track_store.lock();
                    store.push(remote);
                    store.clone()
                };
                let stream = MediaStream::with_id(track.stream_id(), tracks);
                track_sink.send(PeerEvent::Stream(stream));
                Box::pin(async {})
            },
        ));

        let state_sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!(state = %state, "Peer connection state changed");
                if let Some(event) = event_for_state(state) {
                    state_sink.send(event);
                }
                Box::pin(async {})
            }));
    }

    /// Attach the local tracks and, as initiator, publish the offer
    async fn start(&self, local_stream: &MediaStream) -> Result<(), PeerError> {
        for track in local_stream.tracks() {
            let sender = self
                .pc
                .add_track(local_track(track, &self.stream_id))
                .await
                .map_err(|e| PeerError::CreateFailed(format!("add {} track: {e}", track.kind())))?;
            self.senders.lock().insert(track.kind(), sender);
        }

        if self.initiator {
            let offer = self
                .pc
                .create_offer(None)
                .await
                .map_err(|e| transport_err("create offer", e))?;
            self.pc
                .set_local_description(offer.clone())
                .await
                .map_err(|e| transport_err("set local description", e))?;
            self.sink
                .send(PeerEvent::Signal(SignalPayload::Offer { sdp: offer.sdp }));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    async fn apply_remote_signal(&self, payload: SignalPayload) -> Result<(), PeerError> {
        if self.is_destroyed() {
            return Err(PeerError::Destroyed);
        }
        match payload {
            SignalPayload::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| PeerError::InvalidSignal(e.to_string()))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| transport_err("set remote description", e))?;
                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| transport_err("create answer", e))?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|e| transport_err("set local description", e))?;
                self.sink
                    .send(PeerEvent::Signal(SignalPayload::Answer { sdp: answer.sdp }));
            }
            SignalPayload::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| PeerError::InvalidSignal(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| transport_err("set remote description", e))?;
            }
            SignalPayload::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.pc
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| PeerError::InvalidSignal(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn replace_outbound_track(
        &self,
        kind: TrackKind,
        track: Arc<MediaTrack>,
    ) -> Result<(), PeerError> {
        if self.is_destroyed() {
            return Err(PeerError::Destroyed);
        }
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(PeerError::NoSender(kind))?;
        sender
            .replace_track(Some(local_track(&track, &self.stream_id)))
            .await
            .map_err(|e| PeerError::TrackReplacement(e.to_string()))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.close();
        for track in self.remote_tracks.lock().iter() {
            track.stop();
        }

        let pc = self.pc.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::warn!(session = %id, error = %e, "Error closing peer connection");
                    }
                });
            }
            Err(_) => tracing::warn!(session = %id, "No runtime; peer connection left to drop"),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
