//! Call session manager
//!
//! [`CallManager`] is the single owner of the call lifecycle. It drives the
//! phase transitions, holds the current peer session and the local and
//! remote streams, and republishes everything that happens on its
//! [`EventBus`].
//!
//! ```text
//!     idle ──initiate_call──▶ outgoing ──answer / connect──▶ connected
//!       │                                                        │
//!       └──incoming──▶ incoming ──accept_call────────────────────┤
//!                          │                                     │
//!                          └──reject_call──▶ idle ◀──end / error─┘
//! ```
//!
//! Every asynchronous step (media acquisition, transport loading, peer
//! creation, the answer wait) captures the [`CallId`] it started with and
//! re-checks it after resuming. A continuation whose call is no longer
//! current does nothing except release what it acquired.
//!
//! The call context sits behind a `parking_lot` mutex that is never held
//! across an `.await` or while event handlers run. Events are emitted after
//! the transition they announce has been applied.

use crate::events::{CallEvent, CallEventKind, EndReason, EventBus, FailureKind, SubscriptionId};
use crate::media::{MediaAcquirer, MediaDevices, MediaError, MediaStream};
use crate::peer::{PeerError, PeerEvent, PeerFactory, PeerOptions, PeerSession, SignalPayload};
use crate::signaling::{
    RemoteAnswer, SignalingChannel, SignalingError, SignalingMessage, SimulatedSignaling,
};
use crate::simulated::SimulatedDevices;
use crate::transport::{TransportError, TransportResolver};
use crate::types::{CallId, CallPhase, CallState, CallType, CallUser, VideoConstraints};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Operation is not allowed in the current phase
    #[error("{operation} is not allowed while {phase}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// Phase at the time of the call
        phase: CallPhase,
    },

    /// Local media could not be acquired
    #[error("Media acquisition failed: {0}")]
    Media(#[from] MediaError),

    /// No peer constructor could be resolved
    #[error("Transport resolution failed: {0}")]
    Transport(#[from] TransportError),

    /// Peer session failure
    #[error("Peer session failed: {0}")]
    Peer(#[from] PeerError),

    /// Signaling failure or answer timeout
    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    /// The call ended or was replaced while this operation was in flight
    #[error("Call {0} is no longer current")]
    Superseded(CallId),
}

impl CallError {
    /// Category reported in `call-error` events
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidState { .. } | Self::Superseded(_) => FailureKind::InvalidOperation,
            Self::Media(_) => FailureKind::MediaAcquisition,
            Self::Transport(_) => FailureKind::TransportResolution,
            Self::Peer(_) => FailureKind::PeerTransport,
            Self::Signaling(_) => FailureKind::Signaling,
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Delay before the simulated callee answers, in milliseconds
    pub answer_delay_ms: u64,
    /// How long an outgoing call rings before failing, in milliseconds
    pub answer_timeout_ms: u64,
    /// Ideal camera constraints
    pub video: VideoConstraints,
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            answer_delay_ms: 1500,
            answer_timeout_ms: 30_000,
            video: VideoConstraints::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl CallManagerConfig {
    /// Simulated answer delay
    pub fn answer_delay(&self) -> Duration {
        Duration::from_millis(self.answer_delay_ms)
    }

    /// Answer timeout
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

/// Mutable per-call context. Reset wholesale on teardown.
#[derive(Default)]
pub(crate) struct CallContext {
    pub(crate) snapshot: CallState,
    pub(crate) peer: Option<Arc<dyn PeerSession>>,
    pub(crate) started_at: Option<Instant>,
    accepting: bool,
    pending_signals: Vec<SignalPayload>,
}

impl CallContext {
    pub(crate) fn is_current(&self, call_id: CallId) -> bool {
        self.snapshot.call_id == Some(call_id)
    }

    /// Outgoing call still waiting for the remote side
    fn is_ringing(&self, call_id: CallId) -> bool {
        self.is_current(call_id) && self.snapshot.is_outgoing && !self.snapshot.is_in_call
    }
}

pub(crate) struct Inner {
    pub(crate) config: CallManagerConfig,
    pub(crate) context: Mutex<CallContext>,
    pub(crate) events: EventBus,
    pub(crate) media: MediaAcquirer,
    transport: TransportResolver,
    signaling: Arc<dyn SignalingChannel>,
}

/// Call session manager
///
/// Cheap to clone; clones share the same call.
#[derive(Clone)]
pub struct CallManager {
    pub(crate) inner: Arc<Inner>,
}

impl CallManager {
    /// Manager with default configuration, simulated devices and
    /// signaling, and the built-in transport
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a manager
    pub fn builder() -> CallManagerBuilder {
        CallManagerBuilder::new()
    }

    /// Active configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Event bus
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Subscribe to every event
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(handler)
    }

    /// Unsubscribe
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    /// Snapshot of the current call state
    pub fn get_call_state(&self) -> CallState {
        self.inner.context.lock().snapshot.clone()
    }

    /// Identifier of the current call, if any
    pub fn current_call_id(&self) -> Option<CallId> {
        self.inner.context.lock().snapshot.call_id
    }

    pub(crate) fn is_current(&self, call_id: CallId) -> bool {
        self.inner.context.lock().is_current(call_id)
    }

    pub(crate) fn ensure_current(&self, call_id: CallId) -> Result<(), CallError> {
        if self.is_current(call_id) {
            Ok(())
        } else {
            Err(CallError::Superseded(call_id))
        }
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        self.inner.events.emit(&event);
    }

    /// Call `remote_user`
    ///
    /// Acquires local media, resolves the peer transport, sends the call
    /// request and creates the initiator session. Returns once the call is
    /// ringing; the answer arrives later as `call-accepted`,
    /// `call-rejected` or `call-error`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless idle (state untouched).
    /// Any other error has already torn the call down and emitted
    /// `call-error`, except [`CallError::Superseded`], which means the call
    /// was ended while it was being set up.
    #[tracing::instrument(skip(self, remote_user, call_type), fields(peer = %remote_user.id, call_type = %call_type))]
    pub async fn initiate_call(
        &self,
        remote_user: CallUser,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        {
            let mut ctx = self.inner.context.lock();
            let phase = ctx.snapshot.phase();
            if phase != CallPhase::Idle {
                return Err(CallError::InvalidState {
                    operation: "initiate_call",
                    phase,
                });
            }
            ctx.snapshot.is_outgoing = true;
            ctx.snapshot.call_type = Some(call_type);
            ctx.snapshot.remote_user = Some(remote_user.clone());
            ctx.snapshot.call_id = Some(call_id);
            ctx.snapshot.call_start_time = Some(Utc::now());
            ctx.started_at = Some(Instant::now());
        }
        tracing::info!(call_id = %call_id, old_state = %CallPhase::Idle, new_state = %CallPhase::Outgoing, "Initiating call");

        match self.dial(call_id, &remote_user, call_type).await {
            Ok(()) => Ok(call_id),
            Err(e) => {
                self.fail_call(call_id, &e);
                Err(e)
            }
        }
    }

    async fn dial(
        &self,
        call_id: CallId,
        remote_user: &CallUser,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let local = self.acquire_local_media(call_id, call_type).await?;
        let factory = self.inner.transport.resolve().await?;
        self.ensure_current(call_id)?;

        self.inner
            .signaling
            .send(remote_user, SignalingMessage::CallRequest { call_id, call_type })
            .await?;
        self.ensure_current(call_id)?;

        self.start_peer_session(call_id, factory, true, local).await?;
        self.spawn_answer_wait(call_id, remote_user.clone());
        Ok(())
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless a call is ringing and no
    /// accept is already in flight. Other errors have already torn the call
    /// down, as in [`CallManager::initiate_call`].
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (call_id, call_type, remote_user) = {
            let mut ctx = self.inner.context.lock();
            let phase = ctx.snapshot.phase();
            let ringing = (
                ctx.snapshot.call_id,
                ctx.snapshot.call_type,
                ctx.snapshot.remote_user.clone(),
            );
            let (CallPhase::Incoming, false, (Some(call_id), Some(call_type), Some(user))) =
                (phase, ctx.accepting, ringing)
            else {
                return Err(CallError::InvalidState {
                    operation: "accept_call",
                    phase,
                });
            };
            ctx.accepting = true;
            (call_id, call_type, user)
        };
        tracing::info!(call_id = %call_id, "Accepting call");

        match self.pick_up(call_id, call_type, &remote_user).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_call(call_id, &e);
                Err(e)
            }
        }
    }

    async fn pick_up(
        &self,
        call_id: CallId,
        call_type: CallType,
        remote_user: &CallUser,
    ) -> Result<(), CallError> {
        let local = self.acquire_local_media(call_id, call_type).await?;
        let factory = self.inner.transport.resolve().await?;
        self.ensure_current(call_id)?;
        self.start_peer_session(call_id, factory, false, local).await?;

        let connected = {
            let mut ctx = self.inner.context.lock();
            if ctx.is_current(call_id) {
                ctx.accepting = false;
                ctx.snapshot.is_incoming = false;
                ctx.snapshot.is_in_call = true;
                if ctx.snapshot.call_start_time.is_none() {
                    ctx.snapshot.call_start_time = Some(Utc::now());
                }
                if ctx.started_at.is_none() {
                    ctx.started_at = Some(Instant::now());
                }
                true
            } else {
                false
            }
        };
        if !connected {
            return Err(CallError::Superseded(call_id));
        }
        tracing::debug!(call_id = %call_id, old_state = %CallPhase::Incoming, new_state = %CallPhase::Connected, "Call state transition");

        self.inner
            .signaling
            .send(
                remote_user,
                SignalingMessage::CallAnswer {
                    call_id,
                    accepted: true,
                },
            )
            .await?;
        self.ensure_current(call_id)?;

        tracing::info!(call_id = %call_id, "Call accepted");
        self.emit(CallEvent::CallAccepted { call_id });
        Ok(())
    }

    /// Decline the ringing call
    ///
    /// Allowed while an accept is still in flight; the accept then resolves
    /// to [`CallError::Superseded`].
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless a call is ringing.
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (call_id, remote_user) = {
            let ctx = self.inner.context.lock();
            let phase = ctx.snapshot.phase();
            match (phase, ctx.snapshot.call_id) {
                (CallPhase::Incoming, Some(call_id)) => (call_id, ctx.snapshot.remote_user.clone()),
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "reject_call",
                        phase,
                    })
                }
            }
        };

        if !self.teardown_call(call_id) {
            return Err(CallError::Superseded(call_id));
        }
        tracing::info!(call_id = %call_id, "Call rejected");
        self.emit(CallEvent::CallRejected { call_id });

        if let Some(user) = remote_user {
            self.notify_remote(
                &user,
                SignalingMessage::CallAnswer {
                    call_id,
                    accepted: false,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Hang up the current call, whatever its phase
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] when idle.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (call_id, remote_user) = {
            let ctx = self.inner.context.lock();
            match ctx.snapshot.call_id {
                Some(call_id) => (call_id, ctx.snapshot.remote_user.clone()),
                _ => {
                    return Err(CallError::InvalidState {
                        operation: "end_call",
                        phase: ctx.snapshot.phase(),
                    })
                }
            }
        };

        if !self.hang_up(call_id, EndReason::LocalHangup) {
            return Err(CallError::Superseded(call_id));
        }
        if let Some(user) = remote_user {
            self.notify_remote(&user, SignalingMessage::Hangup { call_id })
                .await;
        }
        Ok(())
    }

    /// Present an incoming call from `remote_user`
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] unless idle.
    pub fn simulate_incoming_call(
        &self,
        remote_user: CallUser,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        self.ring(CallId::new(), remote_user, call_type, "simulate_incoming_call")
    }

    fn ring(
        &self,
        call_id: CallId,
        remote_user: CallUser,
        call_type: CallType,
        operation: &'static str,
    ) -> Result<CallId, CallError> {
        {
            let mut ctx = self.inner.context.lock();
            let phase = ctx.snapshot.phase();
            if phase != CallPhase::Idle {
                return Err(CallError::InvalidState { operation, phase });
            }
            ctx.snapshot.is_incoming = true;
            ctx.snapshot.call_type = Some(call_type);
            ctx.snapshot.remote_user = Some(remote_user.clone());
            ctx.snapshot.call_id = Some(call_id);
        }
        tracing::info!(call_id = %call_id, peer = %remote_user.id, call_type = %call_type, "Incoming call");

        self.emit(CallEvent::IncomingCall {
            call_id,
            user: remote_user,
            call_type,
        });
        Ok(call_id)
    }

    /// Feed a message received from the signaling relay
    ///
    /// A call request while busy is declined automatically.
    ///
    /// # Errors
    ///
    /// Returns error if the message is malformed, if a call request arrives
    /// while busy, or if the peer session rejects a signal.
    #[tracing::instrument(skip(self, from, message), fields(from = %from.id, call_id = %message.call_id()))]
    pub async fn handle_signaling_message(
        &self,
        from: CallUser,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        message.validate()?;
        if !matches!(message, SignalingMessage::CallRequest { .. }) && !self.is_remote_user(&from) {
            tracing::trace!(from = %from.id, "Dropping message from a user outside the call");
            return Ok(());
        }
        match message {
            SignalingMessage::CallRequest { call_id, call_type } => {
                match self.ring(call_id, from.clone(), call_type, "incoming_call") {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        tracing::info!(call_id = %call_id, "Busy; declining call request");
                        self.notify_remote(
                            &from,
                            SignalingMessage::CallAnswer {
                                call_id,
                                accepted: false,
                            },
                        )
                        .await;
                        Err(e)
                    }
                }
            }
            SignalingMessage::CallAnswer { call_id, accepted } => {
                let answer = if accepted {
                    RemoteAnswer::Accepted
                } else {
                    RemoteAnswer::Declined
                };
                self.on_answer(call_id, Ok(answer));
                Ok(())
            }
            SignalingMessage::Signal { call_id, payload } => {
                self.apply_remote_signal(call_id, payload).await
            }
            SignalingMessage::Hangup { call_id } => {
                self.hang_up(call_id, EndReason::RemoteHangup);
                Ok(())
            }
        }
    }

    fn is_remote_user(&self, from: &CallUser) -> bool {
        let ctx = self.inner.context.lock();
        ctx.snapshot
            .remote_user
            .as_ref()
            .is_some_and(|user| user.id == from.id)
    }

    async fn apply_remote_signal(
        &self,
        call_id: CallId,
        payload: SignalPayload,
    ) -> Result<(), CallError> {
        let peer = {
            let mut ctx = self.inner.context.lock();
            if !ctx.is_current(call_id) {
                tracing::debug!(call_id = %call_id, "Dropping signal for stale call");
                return Ok(());
            }
            match ctx.peer.clone() {
                Some(peer) => peer,
                None => {
                    ctx.pending_signals.push(payload);
                    return Ok(());
                }
            }
        };
        peer.apply_remote_signal(payload).await?;
        Ok(())
    }

    async fn acquire_local_media(
        &self,
        call_id: CallId,
        call_type: CallType,
    ) -> Result<MediaStream, CallError> {
        let stream = self
            .inner
            .media
            .get_local_media(call_type.wants_video())
            .await?;

        let stored = {
            let mut ctx = self.inner.context.lock();
            if ctx.is_current(call_id) {
                ctx.snapshot.local_stream = Some(stream.clone());
                true
            } else {
                false
            }
        };
        if !stored {
            tracing::debug!(call_id = %call_id, "Call ended during media acquisition; releasing stream");
            stream.stop_all();
            return Err(CallError::Superseded(call_id));
        }

        self.emit(CallEvent::StreamReady {
            call_id,
            stream: stream.clone(),
        });
        Ok(stream)
    }

    async fn start_peer_session(
        &self,
        call_id: CallId,
        factory: Arc<dyn PeerFactory>,
        initiator: bool,
        local_stream: MediaStream,
    ) -> Result<(), CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = PeerOptions {
            initiator,
            local_stream,
            ice_servers: self.inner.config.ice_servers.clone(),
        };
        let session = factory.create(options, tx).await?;

        let pending = {
            let mut ctx = self.inner.context.lock();
            if ctx.is_current(call_id) {
                ctx.peer = Some(session.clone());
                Some(std::mem::take(&mut ctx.pending_signals))
            } else {
                None
            }
        };
        let Some(pending) = pending else {
            session.destroy();
            return Err(CallError::Superseded(call_id));
        };
        tracing::debug!(
            call_id = %call_id,
            session = session.id(),
            factory = factory.name(),
            initiator,
            "Peer session created"
        );

        self.spawn_event_pump(call_id, rx);
        for payload in pending {
            session.apply_remote_signal(payload).await?;
        }
        Ok(())
    }

    fn spawn_event_pump(&self, call_id: CallId, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = CallManager { inner };
                if !manager.is_current(call_id) {
                    break;
                }
                manager.handle_peer_event(call_id, event).await;
            }
            tracing::trace!(call_id = %call_id, "Peer event pump stopped");
        });
    }

    async fn handle_peer_event(&self, call_id: CallId, event: PeerEvent) {
        match event {
            PeerEvent::Signal(payload) => {
                let remote_user = {
                    let ctx = self.inner.context.lock();
                    ctx.is_current(call_id)
                        .then(|| ctx.snapshot.remote_user.clone())
                        .flatten()
                };
                let Some(remote_user) = remote_user else {
                    return;
                };
                tracing::trace!(call_id = %call_id, payload = payload.label(), "Forwarding peer signal");
                if let Err(e) = self
                    .inner
                    .signaling
                    .send(&remote_user, SignalingMessage::Signal { call_id, payload })
                    .await
                {
                    self.fail_call(call_id, &CallError::from(e));
                }
            }
            PeerEvent::Stream(stream) => {
                let stored = {
                    let mut ctx = self.inner.context.lock();
                    if ctx.is_current(call_id) {
                        ctx.snapshot.remote_stream = Some(stream.clone());
                        true
                    } else {
                        false
                    }
                };
                if stored {
                    tracing::debug!(call_id = %call_id, stream_id = %stream.id(), "Remote stream ready");
                    self.emit(CallEvent::RemoteStreamReady { call_id, stream });
                }
            }
            PeerEvent::Connect => self.mark_connected(call_id),
            PeerEvent::Error(message) => {
                if self.teardown_call(call_id) {
                    tracing::error!(call_id = %call_id, error = %message, "Peer transport failed");
                    self.emit(CallEvent::CallError {
                        call_id,
                        kind: FailureKind::PeerTransport,
                        message,
                    });
                    self.emit(CallEvent::CallEnded {
                        call_id,
                        reason: EndReason::PeerFailed,
                    });
                }
            }
            PeerEvent::Close => {
                self.hang_up(call_id, EndReason::PeerClosed);
            }
        }
    }

    fn spawn_answer_wait(&self, call_id: CallId, callee: CallUser) {
        let manager = self.clone();
        let timeout = self.inner.config.answer_timeout();
        tokio::spawn(async move {
            let wait = manager.inner.signaling.await_answer(call_id, &callee);
            let answer = match tokio::time::timeout(timeout, wait).await {
                Ok(answer) => answer,
                Err(_) => Err(SignalingError::Timeout(timeout.as_millis() as u64)),
            };
            manager.on_answer(call_id, answer);
        });
    }

    fn on_answer(&self, call_id: CallId, answer: Result<RemoteAnswer, SignalingError>) {
        if !self.inner.context.lock().is_ringing(call_id) {
            tracing::trace!(call_id = %call_id, "Ignoring answer for call that is not ringing");
            return;
        }
        match answer {
            Ok(RemoteAnswer::Accepted) => self.mark_connected(call_id),
            Ok(RemoteAnswer::Declined) => {
                if self.teardown_call(call_id) {
                    tracing::info!(call_id = %call_id, "Call declined by remote");
                    self.emit(CallEvent::CallRejected { call_id });
                }
            }
            Err(e) => self.fail_call(call_id, &CallError::from(e)),
        }
    }

    /// Promote a ringing outgoing call to connected
    fn mark_connected(&self, call_id: CallId) {
        let promoted = {
            let mut ctx = self.inner.context.lock();
            let ringing = ctx.is_ringing(call_id);
            if ringing {
                ctx.snapshot.is_outgoing = false;
                ctx.snapshot.is_in_call = true;
            }
            ringing
        };
        if promoted {
            tracing::info!(call_id = %call_id, old_state = %CallPhase::Outgoing, new_state = %CallPhase::Connected, "Call connected");
            self.emit(CallEvent::CallAccepted { call_id });
        }
    }

    async fn notify_remote(&self, to: &CallUser, message: SignalingMessage) {
        let call_id = message.call_id();
        if let Err(e) = self.inner.signaling.send(to, message).await {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to notify remote peer");
        }
    }

    /// Tear down and announce `call-ended`. Returns `false` if `call_id`
    /// was not current.
    fn hang_up(&self, call_id: CallId, reason: EndReason) -> bool {
        if !self.teardown_call(call_id) {
            return false;
        }
        tracing::info!(call_id = %call_id, reason = ?reason, "Call ended");
        self.emit(CallEvent::CallEnded { call_id, reason });
        true
    }

    /// Tear down and announce `call-error`. A superseded setup only logs.
    fn fail_call(&self, call_id: CallId, error: &CallError) {
        if let CallError::Superseded(_) = error {
            tracing::debug!(call_id = %call_id, "Setup abandoned; call no longer current");
            return;
        }
        if self.teardown_call(call_id) {
            tracing::error!(call_id = %call_id, error = %error, "Call failed");
            self.emit(CallEvent::CallError {
                call_id,
                kind: error.failure_kind(),
                message: error.to_string(),
            });
        }
    }

    /// Release everything the call holds and return to idle.
    ///
    /// Returns `false` (and does nothing) if `call_id` is not current, so
    /// resources are released exactly once per call.
    pub(crate) fn teardown_call(&self, call_id: CallId) -> bool {
        let old = {
            let mut ctx = self.inner.context.lock();
            if !ctx.is_current(call_id) {
                return false;
            }
            std::mem::take(&mut *ctx)
        };
        let old_state = old.snapshot.phase();

        if let Some(peer) = old.peer {
            peer.destroy();
        }
        if let Some(local) = old.snapshot.local_stream {
            local.stop_all();
        }
        drop(old.snapshot.remote_stream);

        tracing::debug!(call_id = %call_id, old_state = %old_state, new_state = %CallPhase::Idle, "Call torn down");
        true
    }
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`CallManager`]
pub struct CallManagerBuilder {
    config: CallManagerConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    transport: Option<TransportResolver>,
    signaling: Option<Arc<dyn SignalingChannel>>,
}

impl CallManagerBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CallManagerConfig::default(),
            devices: None,
            transport: None,
            signaling: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a platform capture stack (default: [`SimulatedDevices`])
    #[must_use]
    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Use a transport resolver (default: [`TransportResolver::builtin`])
    #[must_use]
    pub fn with_transport(mut self, transport: TransportResolver) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a signaling channel (default: [`SimulatedSignaling`])
    #[must_use]
    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    /// Build the manager
    pub fn build(self) -> CallManager {
        let config = self.config;
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(SimulatedDevices::with_default_devices()));
        let transport = self
            .transport
            .unwrap_or_else(|| TransportResolver::builtin(config.ice_servers.clone()));
        let signaling = self
            .signaling
            .unwrap_or_else(|| Arc::new(SimulatedSignaling::new(config.answer_delay())));

        tracing::debug!(
            answer_delay_ms = config.answer_delay_ms,
            answer_timeout_ms = config.answer_timeout_ms,
            "Call manager created"
        );

        CallManager {
            inner: Arc::new(Inner {
                media: MediaAcquirer::new(devices, config.video.clone()),
                config,
                context: Mutex::new(CallContext::default()),
                events: EventBus::new(),
                transport,
                signaling,
            }),
        }
    }
}

impl Default for CallManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedPeerFactory;
    use crate::transport::TransportExport;
    use pretty_assertions::assert_eq;

    fn manager() -> (CallManager, Arc<SimulatedPeerFactory>) {
        let factory = Arc::new(SimulatedPeerFactory::new());
        let manager = CallManager::builder()
            .with_transport(TransportResolver::new(Some(TransportExport::callable(
                factory.clone(),
            ))))
            .build();
        (manager, factory)
    }

    #[test]
    fn test_config_defaults() {
        let config = CallManagerConfig::default();
        assert_eq!(config.answer_delay(), Duration::from_millis(1500));
        assert_eq!(config.answer_timeout(), Duration::from_secs(30));
        assert_eq!(config.video.ideal_width, 1280);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_config_partial_json() {
        let config: CallManagerConfig =
            serde_json::from_str(r#"{"answer_timeout_ms": 5000}"#).unwrap();
        assert_eq!(config.answer_timeout_ms, 5000);
        assert_eq!(config.answer_delay_ms, 1500);
    }

    #[test]
    fn test_failure_kinds() {
        let media = CallError::from(MediaError::PermissionDenied("camera".into()));
        assert_eq!(media.failure_kind(), FailureKind::MediaAcquisition);
        let transport = CallError::from(TransportError::NoLoader);
        assert_eq!(transport.failure_kind(), FailureKind::TransportResolution);
        let signaling = CallError::from(SignalingError::Timeout(10));
        assert_eq!(signaling.failure_kind(), FailureKind::Signaling);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (manager, factory) = manager();
        let call_id = manager
            .initiate_call(CallUser::new("bob", "Bob"), CallType::Voice)
            .await
            .unwrap();

        assert!(manager.teardown_call(call_id));
        assert!(!manager.teardown_call(call_id));
        assert!(manager.get_call_state().is_idle());
        assert!(factory.last_session().unwrap().is_destroyed());
    }

    #[tokio::test]
    async fn test_signals_before_session_are_buffered() {
        let (manager, factory) = manager();
        let caller = CallUser::new("carol", "Carol");
        let call_id = CallId::new();

        manager
            .handle_signaling_message(
                caller.clone(),
                SignalingMessage::CallRequest {
                    call_id,
                    call_type: CallType::Voice,
                },
            )
            .await
            .unwrap();
        manager
            .handle_signaling_message(
                caller,
                SignalingMessage::Signal {
                    call_id,
                    payload: SignalPayload::Offer { sdp: "v=0".into() },
                },
            )
            .await
            .unwrap();
        assert_eq!(factory.created_count(), 0);

        manager.accept_call().await.unwrap();
        let peer = factory.last_session().unwrap();
        assert_eq!(peer.applied_signals().len(), 1);
    }
}
