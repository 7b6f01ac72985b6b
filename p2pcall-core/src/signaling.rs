//! Call signaling protocol
//!
//! Signaling carries call setup between the two peers: the call request,
//! the answer, the peer sessions' session descriptions and candidates, and
//! hangups. The transport that moves these messages (a relay server, a
//! push channel) lives outside this crate behind [`SignalingChannel`].
//!
//! [`SimulatedSignaling`] is the in-process placeholder: outbound messages
//! are recorded and dropped, and the remote answer is a timed acceptance.

use crate::peer::SignalPayload;
use crate::types::{CallId, CallType, CallUser};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Maximum SDP string length
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate line length
const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// No answer arrived in time
    #[error("No answer within {0} ms")]
    Timeout(u64),

    /// Channel closed
    #[error("Signaling channel closed")]
    Closed,
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Ask the remote user to take a call
    CallRequest {
        /// Call identifier
        call_id: CallId,
        /// Voice or video
        call_type: CallType,
    },

    /// Remote user's decision
    CallAnswer {
        /// Call identifier
        call_id: CallId,
        /// Whether the call was accepted
        accepted: bool,
    },

    /// Peer session payload
    Signal {
        /// Call identifier
        call_id: CallId,
        /// Session description or candidate
        payload: SignalPayload,
    },

    /// Hang up
    Hangup {
        /// Call identifier
        call_id: CallId,
    },
}

impl SignalingMessage {
    /// Get the call ID
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::CallRequest { call_id, .. }
            | Self::CallAnswer { call_id, .. }
            | Self::Signal { call_id, .. }
            | Self::Hangup { call_id } => *call_id,
        }
    }

    /// Check size limits and required fields
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::InvalidMessage`] describing the first problem.
    pub fn validate(&self) -> Result<(), SignalingError> {
        let Self::Signal { payload, .. } = self else {
            return Ok(());
        };
        match payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => {
                if sdp.trim().is_empty() {
                    return Err(SignalingError::InvalidMessage("SDP cannot be empty".into()));
                }
                if sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "SDP too large: {} bytes (max {})",
                        sdp.len(),
                        MAX_SDP_LENGTH
                    )));
                }
            }
            SignalPayload::Candidate { candidate, .. } => {
                if candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::InvalidMessage(format!(
                        "Candidate too large: {} bytes (max {})",
                        candidate.len(),
                        MAX_CANDIDATE_LENGTH
                    )));
                }
            }
        }
        Ok(())
    }

    fn label(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call_request",
            Self::CallAnswer { .. } => "call_answer",
            Self::Signal { payload, .. } => payload.label(),
            Self::Hangup { .. } => "hangup",
        }
    }
}

/// Remote party's decision on an outgoing call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteAnswer {
    /// Callee picked up
    Accepted,
    /// Callee declined
    Declined,
}

/// Signaling channel
///
/// Implement this for your relay. The call manager sends every outbound
/// message through [`SignalingChannel::send`] and waits for the callee's
/// decision with [`SignalingChannel::await_answer`], bounded by the
/// configured answer timeout. Inbound requests, signals and hangups are
/// delivered with [`crate::CallManager::handle_signaling_message`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver `message` to `to`
    async fn send(&self, to: &CallUser, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Resolve once the callee answers `call_id`
    async fn await_answer(
        &self,
        call_id: CallId,
        callee: &CallUser,
    ) -> Result<RemoteAnswer, SignalingError>;
}

/// Timed stand-in for a real relay
pub struct SimulatedSignaling {
    answer_delay: Duration,
    answer: RemoteAnswer,
    sent: Mutex<Vec<(String, SignalingMessage)>>,
}

impl SimulatedSignaling {
    /// Remote accepts after `answer_delay`
    #[must_use]
    pub fn new(answer_delay: Duration) -> Self {
        Self {
            answer_delay,
            answer: RemoteAnswer::Accepted,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Remote declines after `answer_delay`
    #[must_use]
    pub fn declining(answer_delay: Duration) -> Self {
        Self {
            answer: RemoteAnswer::Declined,
            ..Self::new(answer_delay)
        }
    }

    /// Messages sent so far, with the recipient's user id
    pub fn sent_messages(&self) -> Vec<(String, SignalingMessage)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalingChannel for SimulatedSignaling {
    async fn send(&self, to: &CallUser, message: SignalingMessage) -> Result<(), SignalingError> {
        message.validate()?;
        tracing::trace!(to = %to.id, call_id = %message.call_id(), message_type = message.label(), "Simulated signaling send");
        self.sent.lock().push((to.id.clone(), message));
        Ok(())
    }

    async fn await_answer(
        &self,
        call_id: CallId,
        callee: &CallUser,
    ) -> Result<RemoteAnswer, SignalingError> {
        tracing::debug!(call_id = %call_id, callee = %callee.id, delay_ms = self.answer_delay.as_millis() as u64, "Simulating remote answer");
        tokio::time::sleep(self.answer_delay).await;
        Ok(self.answer)
    }
}
