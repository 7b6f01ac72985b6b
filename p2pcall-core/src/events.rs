//! Call events and the event bus
//!
//! The bus is a flat, synchronous publish/subscribe surface: `emit` invokes
//! every matching handler in registration order before returning. Nothing
//! is buffered, so a handler registered after an event fired never sees it.
//! Subscribe before triggering the action whose outcome you need.
//!
//! Events are notifications, not state. Handlers that need the current call
//! state call [`crate::CallManager::get_call_state`]; the manager finishes
//! every transition before emitting, so the snapshot is already up to date.

use crate::media::MediaStream;
use crate::types::{CallId, CallType, CallUser};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event type tag used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEventKind {
    /// A remote party is calling
    IncomingCall,
    /// The call connected
    CallAccepted,
    /// The call was declined (by either side) before connecting
    CallRejected,
    /// The call ended
    CallEnded,
    /// The call failed
    CallError,
    /// Local capture stream is available
    StreamReady,
    /// Remote media is available
    RemoteStreamReady,
}

impl CallEventKind {
    /// Every kind, in declaration order
    pub const ALL: [CallEventKind; 7] = [
        Self::IncomingCall,
        Self::CallAccepted,
        Self::CallRejected,
        Self::CallEnded,
        Self::CallError,
        Self::StreamReady,
        Self::RemoteStreamReady,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomingCall => "incoming-call",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallEnded => "call-ended",
            Self::CallError => "call-error",
            Self::StreamReady => "stream-ready",
            Self::RemoteStreamReady => "remote-stream-ready",
        }
    }
}

impl std::fmt::Display for CallEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote user hung up
    RemoteHangup,
    /// Peer transport closed
    PeerClosed,
    /// Peer transport failed
    PeerFailed,
}

/// Failure category carried by `call-error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Camera/microphone could not be opened
    MediaAcquisition,
    /// No peer connection implementation could be resolved
    TransportResolution,
    /// The peer connection failed
    PeerTransport,
    /// The signaling exchange failed or timed out
    Signaling,
    /// An operation was invoked in the wrong state
    InvalidOperation,
}

/// Call lifecycle notification
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A remote party is calling
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        user: CallUser,
        /// Announced call type
        call_type: CallType,
    },
    /// The call connected
    CallAccepted {
        /// Call identifier
        call_id: CallId,
    },
    /// The call was declined before connecting
    CallRejected {
        /// Call identifier
        call_id: CallId,
    },
    /// The call ended
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
    },
    /// The call failed and was torn down
    CallError {
        /// Call identifier
        call_id: CallId,
        /// Failure category
        kind: FailureKind,
        /// Error description
        message: String,
    },
    /// Local capture stream is available (or was replaced)
    StreamReady {
        /// Call identifier
        call_id: CallId,
        /// The local stream
        stream: MediaStream,
    },
    /// Remote media is available
    RemoteStreamReady {
        /// Call identifier
        call_id: CallId,
        /// The remote stream
        stream: MediaStream,
    },
}

impl CallEvent {
    /// Type tag
    pub fn kind(&self) -> CallEventKind {
        match self {
            Self::IncomingCall { .. } => CallEventKind::IncomingCall,
            Self::CallAccepted { .. } => CallEventKind::CallAccepted,
            Self::CallRejected { .. } => CallEventKind::CallRejected,
            Self::CallEnded { .. } => CallEventKind::CallEnded,
            Self::CallError { .. } => CallEventKind::CallError,
            Self::StreamReady { .. } => CallEventKind::StreamReady,
            Self::RemoteStreamReady { .. } => CallEventKind::RemoteStreamReady,
        }
    }

    /// Call this event belongs to
    pub fn call_id(&self) -> CallId {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::CallAccepted { call_id }
            | Self::CallRejected { call_id }
            | Self::CallEnded { call_id, .. }
            | Self::CallError { call_id, .. }
            | Self::StreamReady { call_id, .. }
            | Self::RemoteStreamReady { call_id, .. } => *call_id,
        }
    }
}

/// Event handler
pub type EventHandler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every kind
    kind: Option<CallEventKind>,
    handler: EventHandler,
}

/// Synchronous, ordered, unbuffered publish/subscribe
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to one event kind
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.subscribe(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event kind
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler))
    }

    fn subscribe(&self, kind: Option<CallEventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push(Subscription { id, kind, handler });
        tracing::trace!(subscription = id.0, kind = ?kind, "Event handler registered");
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// Number of handlers that would receive `kind`
    pub fn handler_count(&self, kind: CallEventKind) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .count()
    }

    /// Deliver `event` to every matching handler, in registration order.
    ///
    /// The handler list is copied before delivery, so handlers may
    /// subscribe, unsubscribe or call back into the manager. A panicking
    /// handler propagates to the emitter.
    pub(crate) fn emit(&self, event: &CallEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| s.handler.clone())
            .collect();

        tracing::debug!(
            event = %kind,
            call_id = %event.call_id(),
            handlers = handlers.len(),
            "Emitting call event"
        );

        for handler in handlers {
            handler(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
