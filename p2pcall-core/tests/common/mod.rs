//! Shared test fixtures

#![allow(dead_code)]

use p2pcall_core::simulated::{SimulatedDevices, SimulatedPeerFactory};
use p2pcall_core::{
    CallEvent, CallEventKind, CallManager, CallManagerConfig, CallUser, SimulatedSignaling,
    TransportExport, TransportResolver,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Answer delay used by the default harness
pub const ANSWER_DELAY: Duration = Duration::from_millis(1500);

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A manager wired to simulated devices, peers and signaling, with every
/// event recorded
pub struct Harness {
    pub manager: CallManager,
    pub devices: Arc<SimulatedDevices>,
    pub factory: Arc<SimulatedPeerFactory>,
    pub signaling: Arc<SimulatedSignaling>,
    pub events: Arc<Mutex<Vec<CallEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            SimulatedDevices::with_default_devices(),
            SimulatedSignaling::new(ANSWER_DELAY),
        )
    }

    pub fn with(devices: SimulatedDevices, signaling: SimulatedSignaling) -> Self {
        Self::with_config(devices, signaling, CallManagerConfig::default())
    }

    pub fn with_config(
        devices: SimulatedDevices,
        signaling: SimulatedSignaling,
        config: CallManagerConfig,
    ) -> Self {
        init_tracing();
        let devices = Arc::new(devices);
        let factory = Arc::new(SimulatedPeerFactory::new());
        let signaling = Arc::new(signaling);
        let manager = CallManager::builder()
            .with_config(config)
            .with_media_devices(devices.clone())
            .with_transport(TransportResolver::new(Some(TransportExport::callable(
                factory.clone(),
            ))))
            .with_signaling(signaling.clone())
            .build();

        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        manager.on_any(move |event| log.lock().push(event.clone()));

        Self {
            manager,
            devices,
            factory,
            signaling,
            events,
        }
    }

    pub fn kinds(&self) -> Vec<CallEventKind> {
        self.events.lock().iter().map(CallEvent::kind).collect()
    }

    pub fn count(&self, kind: CallEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn no_live_tracks(&self) -> bool {
        let remote_live = self
            .factory
            .sessions()
            .iter()
            .flat_map(|peer| peer.remote_tracks())
            .any(|track| track.is_live());
        self.devices.live_track_count() == 0 && !remote_live
    }
}

pub fn bob() -> CallUser {
    CallUser::new("u1", "Bob")
}

pub fn alice() -> CallUser {
    CallUser::new("u2", "Alice").with_avatar("avatars/alice.png")
}

/// Let spawned tasks (peer event pump, answer wait) run
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
