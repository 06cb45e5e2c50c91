//! Server-side socket runtime state
//!
//! One [`Socket`] per accepted WebSocket connection. The socket owns its
//! outbound queue handle, its outstanding-ack registry, its rate-limiter
//! state, and the set of rooms it has joined. All lifecycle transitions go
//! through an explicit state enum.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use skein_protocol::ack::AckCallback;
use skein_protocol::{AckRegistry, Frame, FrameType};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::namespace::{EventHandler, Namespace, RoomEmitter};
use crate::rate_limit::{Admission, SocketRateLimiter};

static NEXT_SOCKET_SEQ: AtomicU64 = AtomicU64::new(1);

/// Opaque socket identifier, unique for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketId(Arc<str>);

impl SocketId {
    /// Allocate a fresh process-unique id
    pub(crate) fn generate() -> Self {
        let seq = NEXT_SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("s{seq:06x}")))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(Arc::from(raw.into()))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Socket lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Upgrade accepted, runtime state being attached
    Connecting,
    /// Dispatching frames
    Open,
    /// Teardown in progress
    Closing,
    /// Fully detached
    Closed,
}

impl SocketState {
    fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition(self, next: SocketState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Open, Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// An accepted connection, owned by the broker runtime
pub struct Socket {
    id: SocketId,
    namespace: Arc<Namespace>,
    state: Mutex<SocketState>,
    data: Mutex<HashMap<String, Value>>,
    rooms: Mutex<HashSet<String>>,
    handlers: RwLock<HashMap<String, EventHandler>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    acks: AckRegistry,
    limiter: Mutex<SocketRateLimiter>,
    last_activity: Mutex<Instant>,
    metrics: Arc<BrokerMetrics>,
}

impl Socket {
    pub(crate) fn new(
        namespace: Arc<Namespace>,
        outbound: mpsc::Sender<Frame>,
        acks: AckRegistry,
        limiter: SocketRateLimiter,
        metrics: Arc<BrokerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SocketId::generate(),
            namespace,
            state: Mutex::new(SocketState::Connecting),
            data: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashSet::new()),
            handlers: RwLock::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            acks,
            limiter: Mutex::new(limiter),
            last_activity: Mutex::new(Instant::now()),
            metrics,
        })
    }

    /// Stable id, unique for the process lifetime
    pub fn id(&self) -> &SocketId {
        &self.id
    }

    /// The namespace this socket is bound to
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Namespace path the socket was accepted on
    pub fn namespace_path(&self) -> &str {
        self.namespace.path()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SocketState {
        *lock(&self.state)
    }

    /// Whether the socket is currently dispatching frames
    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    pub(crate) fn transition(&self, next: SocketState) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if !state.can_transition(next) {
            return Err(BrokerError::InvalidTransition {
                from: state.name(),
                to: next.name(),
            });
        }
        debug!(socket = %self.id, from = state.name(), to = next.name(), "socket state");
        *state = next;
        Ok(())
    }

    /// Read a value from the user-data scratchpad
    pub fn data(&self, key: &str) -> Option<Value> {
        lock(&self.data).get(key).cloned()
    }

    /// Write a value into the user-data scratchpad
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        lock(&self.data).insert(key.into(), value);
    }

    /// Register a handler on this socket only. Consulted after the
    /// namespace handler table and before the server-level table.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Socket>, Value, Option<skein_protocol::AckReply>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.into(), Arc::new(handler));
    }

    pub(crate) fn handler(&self, event: &str) -> Option<EventHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned()
    }

    /// Join a room in this socket's namespace. Idempotent.
    pub fn join(&self, room: impl Into<String>) {
        let room = room.into();
        let mut rooms = lock(&self.rooms);
        if rooms.insert(room.clone()) {
            self.namespace.rooms().join(&self.id, &room);
            debug!(socket = %self.id, %room, "joined room");
        }
    }

    /// Leave a room. Silent no-op when not a member.
    pub fn leave(&self, room: &str) {
        let mut rooms = lock(&self.rooms);
        if rooms.remove(room) {
            self.namespace.rooms().leave(&self.id, room);
            debug!(socket = %self.id, %room, "left room");
        }
    }

    /// Snapshot of rooms this socket has joined
    pub fn rooms(&self) -> Vec<String> {
        lock(&self.rooms).iter().cloned().collect()
    }

    /// Drain the joined-room set during teardown
    pub(crate) fn take_rooms(&self) -> HashSet<String> {
        std::mem::take(&mut *lock(&self.rooms))
    }

    /// Emit an event to this socket
    pub fn emit(&self, event: &str, data: Value) {
        if crate::namespace::refuse_reserved(event) {
            return;
        }
        self.send(Frame::event(self.namespace.path(), event, data));
    }

    /// Emit an event and register a callback for the peer's ack.
    ///
    /// The callback fires exactly once: with the peer's payload, or with
    /// the synthesized `ack_timeout` payload.
    pub fn emit_with_ack(&self, event: &str, data: Value, callback: AckCallback) {
        if crate::namespace::refuse_reserved(event) {
            return;
        }
        let ack_id = self.acks.register(callback);
        self.send(Frame::event_with_ack(
            self.namespace.path(),
            event,
            ack_id,
            data,
        ));
    }

    /// Emit to every other socket in `room` (sender excluded)
    pub fn to(&self, room: impl Into<String>) -> RoomEmitter<'_> {
        RoomEmitter::scoped(&self.namespace, room.into(), Some(self.id.clone()))
    }

    /// Queue a frame for the writer task. Frames to non-open sockets and
    /// frames that find the queue full are dropped.
    pub(crate) fn send(&self, frame: Frame) {
        if !matches!(self.state(), SocketState::Open | SocketState::Closing)
            && frame.frame_type != FrameType::Connect
        {
            debug!(socket = %self.id, "dropping frame to non-open socket");
            return;
        }
        let sender = lock(&self.outbound).clone();
        let Some(sender) = sender else {
            return;
        };
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    socket = %self.id,
                    event = %frame.event,
                    "outbound queue full, dropping frame"
                );
                self.metrics.incr_frames_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Clone of the raw outbound sender, for ack replies
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Frame>> {
        lock(&self.outbound).clone()
    }

    /// Drop the outbound sender so the writer task drains and exits
    pub(crate) fn close_outbound(&self) {
        lock(&self.outbound).take();
    }

    /// Outstanding-ack registry owned by this socket (as sender)
    pub(crate) fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    /// Run the rate limiter for one inbound frame
    pub(crate) fn admit(&self, event: &str, now: Instant) -> Admission {
        lock(&self.limiter).admit(event, now)
    }

    /// Record inbound activity
    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Instant of the last inbound frame
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("namespace", &self.namespace.path())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceRegistry;
    use crate::rate_limit::RateLimitConfig;
    use std::time::Duration;

    fn test_socket() -> (Arc<Socket>, mpsc::Receiver<Frame>) {
        let registry = NamespaceRegistry::new();
        let ns = registry.create("/t").unwrap();
        let (tx, rx) = mpsc::channel(16);
        let socket = Socket::new(
            ns,
            tx,
            AckRegistry::new(Duration::from_secs(30)),
            SocketRateLimiter::new(RateLimitConfig::default()),
            Arc::new(BrokerMetrics::default()),
        );
        (socket, rx)
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let (socket, _rx) = test_socket();
        assert_eq!(socket.state(), SocketState::Connecting);
        socket.transition(SocketState::Open).unwrap();
        socket.transition(SocketState::Closing).unwrap();
        socket.transition(SocketState::Closed).unwrap();
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let (socket, _rx) = test_socket();
        // Connecting -> Closing skips Open
        assert!(socket.transition(SocketState::Closing).is_err());
        socket.transition(SocketState::Open).unwrap();
        assert!(socket.transition(SocketState::Connecting).is_err());
    }

    #[tokio::test]
    async fn test_join_keeps_index_and_socket_in_lockstep() {
        let (socket, _rx) = test_socket();
        socket.join("r1");
        socket.join("r1");
        assert_eq!(socket.rooms(), vec!["r1".to_string()]);
        assert!(socket.namespace().rooms().contains("r1", socket.id()));

        socket.leave("r1");
        assert!(socket.rooms().is_empty());
        assert!(!socket.namespace().rooms().contains("r1", socket.id()));

        // Leaving again is a silent no-op
        socket.leave("r1");
    }

    #[tokio::test]
    async fn test_emit_enqueues_event_frame() {
        let (socket, mut rx) = test_socket();
        socket.transition(SocketState::Open).unwrap();
        socket.emit("greet", serde_json::json!({"hello": true}));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Event);
        assert_eq!(frame.event, "greet");
        assert_eq!(frame.namespace, "/t");
    }

    #[tokio::test]
    async fn test_emit_reserved_name_is_refused() {
        let (socket, mut rx) = test_socket();
        socket.transition(SocketState::Open).unwrap();
        socket.emit("connected", Value::Null);
        socket.emit("__rate-limited__", Value::Null);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_to_non_open_socket_dropped() {
        let (socket, mut rx) = test_socket();
        socket.emit("early", Value::Null);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_data_scratchpad() {
        let (socket, _rx) = test_socket();
        assert!(socket.data("authenticated").is_none());
        socket.set_data("authenticated", Value::Bool(true));
        assert_eq!(socket.data("authenticated"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_socket_ids_unique() {
        let (a, _rxa) = test_socket();
        let (b, _rxb) = test_socket();
        assert_ne!(a.id(), b.id());
    }
}
