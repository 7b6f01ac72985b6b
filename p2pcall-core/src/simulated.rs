//! In-process platform implementations
//!
//! Fake capture devices, a loopback-free peer factory whose sessions are
//! driven by hand, and a transport loader. They back the default device
//! stack and the test-suite; every one of them can be told to fail.

use crate::media::{
    DeviceInfo, DeviceKind, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind,
    TrackSettings,
};
use crate::peer::{
    PeerError, PeerEvent, PeerEventSender, PeerFactory, PeerOptions, PeerSession, SignalPayload,
};
use crate::transport::{TransportError, TransportExport, TransportLoader};
use crate::types::{MediaConstraints, VideoConstraints};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Capture profiles every simulated camera supports
const CAMERA_PROFILES: [(u32, u32, u32); 3] = [(640, 480, 30), (1280, 720, 30), (1920, 1080, 24)];

/// Fake capture devices
pub struct SimulatedDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    busy: Mutex<HashSet<String>>,
    failure: Mutex<Option<MediaError>>,
    delay: Mutex<Duration>,
    issued: Mutex<Vec<Arc<MediaTrack>>>,
    requests: AtomicUsize,
}

impl SimulatedDevices {
    /// No devices at all
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            busy: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            issued: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
        }
    }

    /// One microphone and one camera
    #[must_use]
    pub fn with_default_devices() -> Self {
        let devices = Self::new();
        devices.add_device(DeviceInfo::audio_input("default-audio", "Default Audio Device"));
        devices.add_device(DeviceInfo::video_input("default-video", "Default Video Device"));
        devices
    }

    /// Plug in a device
    pub fn add_device(&self, device: DeviceInfo) {
        self.devices.lock().push(device);
    }

    /// Mark a device as held by another application
    pub fn set_busy(&self, device_id: &str, busy: bool) {
        let mut set = self.busy.lock();
        if busy {
            set.insert(device_id.to_string());
        } else {
            set.remove(device_id);
        }
    }

    /// Fail every request with `error` until cleared
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    /// Stop failing
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Simulated permission-prompt latency
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued.lock().clone()
    }

    /// Number of tracks still live
    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }

    /// Number of `get_user_media` calls
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn pick(&self, kind: DeviceKind, exact: Option<&str>) -> Result<DeviceInfo, MediaError> {
        let devices = self.devices.lock();
        let mut candidates = devices.iter().filter(|d| d.kind == kind);
        let device = match exact {
            Some(id) => candidates.find(|d| d.device_id == id).ok_or_else(|| {
                MediaError::ConstraintNotSatisfied(format!("no device with id {id}"))
            })?,
            None => candidates
                .next()
                .ok_or_else(|| MediaError::DeviceNotFound(format!("no {kind:?} device")))?,
        };
        if self.busy.lock().contains(&device.device_id) {
            return Err(MediaError::DeviceBusy(device.label.clone()));
        }
        Ok(device.clone())
    }

    /// Closest supported profile to the ideal, by pixel count then frame rate
    fn closest_profile(ideal: &VideoConstraints) -> TrackSettings {
        let target = u64::from(ideal.ideal_width) * u64::from(ideal.ideal_height);
        let (width, height, frame_rate) = CAMERA_PROFILES
            .iter()
            .copied()
            .min_by_key(|(w, h, fps)| {
                let pixels = u64::from(*w) * u64::from(*h);
                (pixels.abs_diff(target), fps.abs_diff(ideal.ideal_frame_rate))
            })
            .unwrap_or(CAMERA_PROFILES[1]);
        TrackSettings {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
        }
    }
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self::with_default_devices()
    }
}

#[async_trait]
impl MediaDevices for SimulatedDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.devices.lock().clone())
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            let mic = self.pick(DeviceKind::AudioInput, None)?;
            tracks.push(Arc::new(MediaTrack::new(
                TrackKind::Audio,
                mic.label,
                Some(mic.device_id),
                TrackSettings::default(),
            )));
        }
        if let Some(video) = &constraints.video {
            let camera = self.pick(DeviceKind::VideoInput, video.device_id.as_deref())?;
            tracks.push(Arc::new(MediaTrack::new(
                TrackKind::Video,
                camera.label,
                Some(camera.device_id),
                Self::closest_profile(video),
            )));
        }

        self.issued.lock().extend(tracks.iter().cloned());
        Ok(MediaStream::new(tracks))
    }
}

/// Peer session driven by hand
pub struct SimulatedPeer {
    id: String,
    initiator: bool,
    events: Mutex<Option<PeerEventSender>>,
    destroyed: AtomicBool,
    remote_tracks: Mutex<Vec<Arc<MediaTrack>>>,
    replaced: Mutex<Vec<(TrackKind, String)>>,
    replaced_enabled: Mutex<Vec<bool>>,
    applied: Mutex<Vec<SignalPayload>>,
    outbound: Mutex<Vec<TrackKind>>,
}

impl SimulatedPeer {
    fn new(options: &PeerOptions, events: PeerEventSender) -> Self {
        Self {
            id: format!("sim-peer-{}", Uuid::new_v4()),
            initiator: options.initiator,
            events: Mutex::new(Some(events)),
            destroyed: AtomicBool::new(false),
            remote_tracks: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            replaced_enabled: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            outbound: Mutex::new(options.local_stream.tracks().iter().map(|t| t.kind()).collect()),
        }
    }

    fn send(&self, event: PeerEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a remote stream (audio, plus video when asked)
    pub fn emit_remote_stream(&self, with_video: bool) -> Option<MediaStream> {
        if self.is_destroyed() {
            return None;
        }
        let mut tracks = vec![Arc::new(MediaTrack::new(
            TrackKind::Audio,
            "remote audio",
            None,
            TrackSettings::default(),
        ))];
        if with_video {
            tracks.push(Arc::new(MediaTrack::new(
                TrackKind::Video,
                "remote video",
                None,
                TrackSettings::default(),
            )));
        }
        let stream = MediaStream::new(tracks);
        self.remote_tracks
            .lock()
            .extend(stream.tracks().iter().cloned());
        self.send(PeerEvent::Stream(stream.clone())).then_some(stream)
    }

    /// Report the transport handshake as complete
    pub fn emit_connect(&self) -> bool {
        self.send(PeerEvent::Connect)
    }

    /// Report a transport failure
    pub fn emit_error(&self, message: &str) -> bool {
        self.send(PeerEvent::Error(message.to_string()))
    }

    /// Report the transport as closed
    pub fn emit_close(&self) -> bool {
        self.send(PeerEvent::Close)
    }

    /// Emit an outbound signal
    pub fn emit_signal(&self, payload: SignalPayload) -> bool {
        self.send(PeerEvent::Signal(payload))
    }

    /// Remote tracks this session created
    pub fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.remote_tracks.lock().clone()
    }

    /// Track replacements so far, as (kind, new track id)
    pub fn replaced_tracks(&self) -> Vec<(TrackKind, String)> {
        self.replaced.lock().clone()
    }

    /// Enabled flag of each replacement track at the moment it was handed over
    pub fn replaced_enabled_flags(&self) -> Vec<bool> {
        self.replaced_enabled.lock().clone()
    }

    /// Remote signals applied so far
    pub fn applied_signals(&self) -> Vec<SignalPayload> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl PeerSession for SimulatedPeer {
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
        let answer_needed = matches!(payload, SignalPayload::Offer { .. });
        if answer_needed && self.initiator {
            return Err(PeerError::InvalidSignal("initiator cannot take an offer".into()));
        }
        self.applied.lock().push(payload);
        if answer_needed {
            self.emit_signal(SignalPayload::Answer {
                sdp: format!("v=0 simulated-answer {}", self.id),
            });
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
        if !self.outbound.lock().contains(&kind) {
            return Err(PeerError::NoSender(kind));
        }
        self.replaced.lock().push((kind, track.id().to_string()));
        self.replaced_enabled.lock().push(track.is_enabled());
        Ok(())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.lock().take();
        for track in self.remote_tracks.lock().iter() {
            track.stop();
        }
        tracing::debug!(session = %self.id, "Simulated peer destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Factory for [`SimulatedPeer`]s
pub struct SimulatedPeerFactory {
    name: String,
    sessions: Mutex<Vec<Arc<SimulatedPeer>>>,
    failure: Mutex<Option<PeerError>>,
}

impl SimulatedPeerFactory {
    /// Factory named "simulated"
    #[must_use]
    pub fn new() -> Self {
        Self::named("simulated")
    }

    /// Factory with a custom name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sessions: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Fail every `create` with `error` until cleared
    pub fn fail_with(&self, error: PeerError) {
        *self.failure.lock() = Some(error);
    }

    /// Number of sessions created
    pub fn created_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Most recent session
    pub fn last_session(&self) -> Option<Arc<SimulatedPeer>> {
        self.sessions.lock().last().cloned()
    }

    /// Every session created
    pub fn sessions(&self) -> Vec<Arc<SimulatedPeer>> {
        self.sessions.lock().clone()
    }
}

impl Default for SimulatedPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerFactory for SimulatedPeerFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        options: PeerOptions,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>, PeerError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let peer = Arc::new(SimulatedPeer::new(&options, events));
        if options.initiator {
            peer.emit_signal(SignalPayload::Offer {
                sdp: format!("v=0 simulated-offer {}", peer.id),
            });
        }
        self.sessions.lock().push(peer.clone());
        Ok(peer)
    }
}

/// Transport loader returning a fixed module
pub struct SimulatedLoader {
    module: Option<TransportExport>,
    loads: AtomicUsize,
}

impl SimulatedLoader {
    /// Loader that succeeds with `module`
    #[must_use]
    pub fn new(module: TransportExport) -> Self {
        Self {
            module: Some(module),
            loads: AtomicUsize::new(0),
        }
    }

    /// Loader that always fails
    #[must_use]
    pub fn failing() -> Self {
        Self {
            module: None,
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of load attempts
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportLoader for SimulatedLoader {
    async fn load(&self) -> Result<TransportExport, TransportError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.module
            .clone()
            .ok_or_else(|| TransportError::LoadFailed("module not found".into()))
    }
}
