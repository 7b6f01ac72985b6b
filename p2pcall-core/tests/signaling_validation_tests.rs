//! Signaling validation and edge case tests

mod common;

use common::{alice, Harness};
use p2pcall_core::{
    CallError, CallType, SignalPayload, SignalingError, SignalingMessage,
};

#[tokio::test]
async fn inbound_signal_rejects_empty_sdp() {
    let h = Harness::new();
    let call_id = h
        .manager
        .simulate_incoming_call(alice(), CallType::Voice)
        .unwrap();
    h.manager.accept_call().await.unwrap();

    let res = h
        .manager
        .handle_signaling_message(
            alice(),
            SignalingMessage::Signal {
                call_id,
                payload: SignalPayload::Answer { sdp: String::new() },
            },
        )
        .await;

    assert!(matches!(res, Err(CallError::Signaling(SignalingError::InvalidMessage(ref msg))) if msg.contains("cannot be empty")));
    assert!(h.manager.get_call_state().is_in_call);
    assert!(h.factory.last_session().unwrap().applied_signals().is_empty());
}

#[tokio::test]
async fn inbound_signal_rejects_oversized_candidate() {
    let h = Harness::new();
    let call_id = h
        .manager
        .simulate_incoming_call(alice(), CallType::Voice)
        .unwrap();
    h.manager.accept_call().await.unwrap();

    let res = h
        .manager
        .handle_signaling_message(
            alice(),
            SignalingMessage::Signal {
                call_id,
                payload: SignalPayload::Candidate {
                    candidate: "a".repeat(4096),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            },
        )
        .await;

    assert!(matches!(res, Err(CallError::Signaling(SignalingError::InvalidMessage(ref msg))) if msg.contains("too large")));
    assert!(h.manager.get_call_state().is_in_call);
}

#[tokio::test]
async fn initiator_rejects_a_second_offer() {
    let h = Harness::new();
    let call_id = h
        .manager
        .initiate_call(alice(), CallType::Voice)
        .await
        .unwrap();

    let res = h
        .manager
        .handle_signaling_message(
            alice(),
            SignalingMessage::Signal {
                call_id,
                payload: SignalPayload::Offer {
                    sdp: "v=0 glare".into(),
                },
            },
        )
        .await;

    assert!(matches!(res, Err(CallError::Peer(_))));
    assert!(h.manager.get_call_state().is_outgoing);
}

#[tokio::test]
async fn signaling_message_wire_round_trip() {
    let raw = r#"{"type":"signal","call_id":"6f1c1f34-8a67-4a0e-9d3c-5b1e0a2f9c11","payload":{"type":"candidate","candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdp_mid":"0","sdp_mline_index":0}}"#;
    let message: SignalingMessage = serde_json::from_str(raw).unwrap();
    assert!(message.validate().is_ok());

    let h = Harness::new();
    // no current call: applied to nothing, not an error
    h.manager
        .handle_signaling_message(alice(), message)
        .await
        .unwrap();
    assert!(h.manager.get_call_state().is_idle());
}
