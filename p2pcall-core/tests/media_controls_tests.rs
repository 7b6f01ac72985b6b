//! Mute, camera and duration controls during a call

mod common;

use common::{alice, settle, Harness, ANSWER_DELAY};
use p2pcall_core::simulated::SimulatedDevices;
use p2pcall_core::{
    CallError, CallEvent, CallEventKind, CallType, DeviceInfo, MediaError, SimulatedSignaling,
    TrackKind,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn two_cameras() -> SimulatedDevices {
    let devices = SimulatedDevices::with_default_devices();
    devices.add_device(DeviceInfo::video_input("cam-2", "Rear Camera"));
    devices
}

async fn connected(h: &Harness, call_type: CallType) {
    h.manager.simulate_incoming_call(alice(), call_type).unwrap();
    h.manager.accept_call().await.unwrap();
}

#[tokio::test]
async fn toggle_mute_twice_restores_state() {
    let h = Harness::new();
    connected(&h, CallType::Voice).await;
    let stream = h.manager.get_call_state().local_stream.unwrap();
    let mic = stream.audio_tracks().next().unwrap().clone();

    assert!(h.manager.toggle_mute());
    assert!(h.manager.get_call_state().is_muted);
    assert!(!mic.is_enabled());
    assert!(mic.is_live());

    assert!(!h.manager.toggle_mute());
    assert!(!h.manager.get_call_state().is_muted);
    assert!(mic.is_enabled());
}

#[tokio::test]
async fn toggle_video_disables_camera_track() {
    let h = Harness::new();
    connected(&h, CallType::Video).await;
    let camera = h
        .manager
        .get_call_state()
        .local_stream
        .unwrap()
        .video_track()
        .unwrap()
        .clone();

    assert!(!h.manager.toggle_video());
    assert!(!camera.is_enabled());
    assert!(!h.manager.get_call_state().is_video_enabled);

    assert!(h.manager.toggle_video());
    assert!(camera.is_enabled());
}

#[tokio::test]
async fn switch_camera_with_one_camera_is_a_noop() {
    let h = Harness::new();
    connected(&h, CallType::Video).await;
    let before = h.manager.get_call_state();

    assert!(!h.manager.switch_camera().await.unwrap());
    assert_eq!(h.manager.get_call_state(), before);
    assert!(h.factory.last_session().unwrap().replaced_tracks().is_empty());
}

#[tokio::test]
async fn switch_camera_cycles_through_devices() {
    let h = Harness::with(two_cameras(), SimulatedSignaling::new(ANSWER_DELAY));
    connected(&h, CallType::Video).await;
    let original = h.manager.get_call_state().local_stream.unwrap();
    let old_camera = original.video_track().unwrap().clone();
    assert_eq!(old_camera.device_id(), Some("default-video"));

    assert!(h.manager.switch_camera().await.unwrap());

    let switched = h.manager.get_call_state().local_stream.unwrap();
    let new_camera = switched.video_track().unwrap().clone();
    assert_eq!(switched.id(), original.id());
    assert_eq!(new_camera.device_id(), Some("cam-2"));
    assert!(!old_camera.is_live());
    assert_eq!(switched.audio_tracks().count(), 1);

    let replaced = h.factory.last_session().unwrap().replaced_tracks();
    assert_eq!(replaced, vec![(TrackKind::Video, new_camera.id().to_string())]);
    assert!(matches!(
        h.events.lock().last(),
        Some(CallEvent::StreamReady { stream, .. }) if *stream == switched
    ));

    assert!(h.manager.switch_camera().await.unwrap());
    let back = h.manager.get_call_state().local_stream.unwrap();
    assert_eq!(back.video_track().unwrap().device_id(), Some("default-video"));
    assert!(!new_camera.is_live());
}

#[tokio::test]
async fn switched_camera_keeps_video_disabled() {
    let h = Harness::with(two_cameras(), SimulatedSignaling::new(ANSWER_DELAY));
    connected(&h, CallType::Video).await;
    h.manager.toggle_video();

    assert!(h.manager.switch_camera().await.unwrap());

    let camera = h
        .manager
        .get_call_state()
        .local_stream
        .unwrap()
        .video_track()
        .unwrap()
        .clone();
    assert!(!camera.is_enabled());
    assert_eq!(
        h.factory.last_session().unwrap().replaced_enabled_flags(),
        vec![false]
    );
}

#[tokio::test]
async fn switch_camera_requires_connected_video_call() {
    let h = Harness::with(two_cameras(), SimulatedSignaling::new(ANSWER_DELAY));
    assert!(matches!(
        h.manager.switch_camera().await,
        Err(CallError::InvalidState { .. })
    ));

    connected(&h, CallType::Voice).await;
    assert!(matches!(
        h.manager.switch_camera().await,
        Err(CallError::InvalidState {
            operation: "switch_camera",
            ..
        })
    ));
}

#[tokio::test]
async fn failed_switch_keeps_the_current_camera() {
    let h = Harness::with(two_cameras(), SimulatedSignaling::new(ANSWER_DELAY));
    connected(&h, CallType::Video).await;
    let before = h.manager.get_call_state();
    let events_before = h.events.lock().len();
    h.devices.set_busy("cam-2", true);

    let err = h.manager.switch_camera().await.unwrap_err();

    assert!(matches!(err, CallError::Media(MediaError::DeviceBusy(_))));
    assert_eq!(h.manager.get_call_state(), before);
    assert!(before
        .local_stream
        .unwrap()
        .video_track()
        .unwrap()
        .is_live());
    assert_eq!(h.events.lock().len(), events_before);
}

#[tokio::test]
async fn controls_are_noops_once_the_call_ends() {
    let h = Harness::new();
    connected(&h, CallType::Video).await;
    h.manager.end_call().await.unwrap();

    assert!(!h.manager.toggle_mute());
    assert!(h.manager.toggle_video());
    assert!(h.manager.get_call_state().is_idle());
    assert_eq!(h.count(CallEventKind::CallEnded), 1);
}

#[tokio::test(start_paused = true)]
async fn call_duration_tracks_connected_time() {
    let h = Harness::new();
    h.manager
        .simulate_incoming_call(alice(), CallType::Voice)
        .unwrap();
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(h.manager.get_call_duration(), Duration::ZERO);

    h.manager.accept_call().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    let first = h.manager.get_call_duration();
    assert!(first >= Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(2)).await;
    let second = h.manager.get_call_duration();
    assert!(second >= first + Duration::from_secs(2));

    h.manager.end_call().await.unwrap();
    settle().await;
    assert_eq!(h.manager.get_call_duration(), Duration::ZERO);
}
