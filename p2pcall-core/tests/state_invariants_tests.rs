//! Property tests over random operation sequences
//!
//! Run with: cargo test --test state_invariants_tests

mod common;

use common::{alice, bob, settle, Harness};
use p2pcall_core::simulated::SimulatedDevices;
use p2pcall_core::{CallType, DeviceInfo, SimulatedSignaling};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Initiate(CallType),
    Incoming(CallType),
    Accept,
    Reject,
    End,
    ToggleMute,
    ToggleVideo,
    SwitchCamera,
    PeerConnect,
    PeerError,
    PeerClose,
    RemoteStream,
    Wait(u64),
}

fn call_type() -> impl Strategy<Value = CallType> {
    prop_oneof![Just(CallType::Voice), Just(CallType::Video)]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        call_type().prop_map(Op::Initiate),
        call_type().prop_map(Op::Incoming),
        Just(Op::Accept),
        Just(Op::Reject),
        Just(Op::End),
        Just(Op::ToggleMute),
        Just(Op::ToggleVideo),
        Just(Op::SwitchCamera),
        Just(Op::PeerConnect),
        Just(Op::PeerError),
        Just(Op::PeerClose),
        Just(Op::RemoteStream),
        (0u64..3000).prop_map(Op::Wait),
    ]
}

fn harness(declining: bool) -> Harness {
    let devices = SimulatedDevices::with_default_devices();
    devices.add_device(DeviceInfo::video_input("cam-2", "Rear Camera"));
    let delay = Duration::from_millis(1500);
    let signaling = if declining {
        SimulatedSignaling::declining(delay)
    } else {
        SimulatedSignaling::new(delay)
    };
    Harness::with(devices, signaling)
}

/// Runs `ops`, checking the invariants after every step
fn run(ops: Vec<Op>, declining: bool) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    runtime.block_on(async move {
        let h = harness(declining);
        for op in ops {
            let mut released = false;
            match op {
                Op::Initiate(t) => {
                    let _ = h.manager.initiate_call(bob(), t).await;
                }
                Op::Incoming(t) => {
                    let _ = h.manager.simulate_incoming_call(alice(), t);
                }
                Op::Accept => {
                    let _ = h.manager.accept_call().await;
                }
                Op::Reject => released = h.manager.reject_call().await.is_ok(),
                Op::End => released = h.manager.end_call().await.is_ok(),
                Op::ToggleMute => {
                    h.manager.toggle_mute();
                }
                Op::ToggleVideo => {
                    h.manager.toggle_video();
                }
                Op::SwitchCamera => {
                    let _ = h.manager.switch_camera().await;
                }
                Op::PeerConnect => {
                    if let Some(peer) = h.factory.last_session() {
                        peer.emit_connect();
                    }
                }
                Op::PeerError => {
                    if let Some(peer) = h.factory.last_session() {
                        peer.emit_error("simulated failure");
                    }
                }
                Op::PeerClose => {
                    if let Some(peer) = h.factory.last_session() {
                        peer.emit_close();
                    }
                }
                Op::RemoteStream => {
                    if let Some(peer) = h.factory.last_session() {
                        peer.emit_remote_stream(true);
                    }
                }
                Op::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            }
            settle().await;

            let state = h.manager.get_call_state();
            prop_assert!(
                !(state.is_incoming && state.is_outgoing),
                "incoming and outgoing both set: {:?}",
                state
            );
            if state.is_in_call {
                prop_assert!(state.call_start_time.is_some());
            }
            if released {
                prop_assert!(state.is_idle(), "not idle after release: {:?}", state);
                prop_assert!(h.no_live_tracks(), "live tracks after release");
            }
            if state.is_idle() {
                prop_assert!(h.no_live_tracks(), "idle with live tracks");
                prop_assert_eq!(h.manager.get_call_duration(), Duration::ZERO);
            }
        }
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// INVARIANT: phase flags stay exclusive and teardown releases everything
    #[test]
    fn random_sequences_keep_invariants(ops in prop::collection::vec(op(), 1..40)) {
        run(ops, false)?;
    }

    /// Same, with a callee that always declines
    #[test]
    fn random_sequences_with_declining_callee(ops in prop::collection::vec(op(), 1..40)) {
        run(ops, true)?;
    }
}
