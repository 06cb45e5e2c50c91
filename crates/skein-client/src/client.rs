//! Client runtime
//!
//! One driver task owns the WebSocket transport: it connects, flushes the
//! offline queue, then multiplexes user commands, inbound frames, and the
//! heartbeat clock. Transport loss feeds the reconnect loop with capped
//! exponential backoff; user-facing lifecycle events (`connected`,
//! `reconnected`, `disconnected`, `max_reconnect_reached`) fire through
//! the same handler table as wire events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use skein_protocol::error::codes;
use skein_protocol::{AckRegistry, AckReply, CodecConfig, Frame, FrameCodec, FrameType};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::ClientError;
use crate::queue::{OfflineQueue, QueuedEmit};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMsg>;

/// Handler invoked for an inbound event (or a local lifecycle event).
/// Receives the payload and, for wire events that requested one, a
/// one-shot ack responder.
pub type ClientHandler = Arc<dyn Fn(Value, Option<AckReply>) + Send + Sync>;

/// Consecutive unanswered heartbeats before a forced reconnect
const MAX_HEARTBEAT_MISSES: u32 = 3;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:4500`
    pub url: String,
    /// Namespace path joined onto the URL, e.g. `/chat`
    pub namespace: String,
    /// Base reconnect delay (grows by 1.5x per attempt, capped at 60 s)
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the terminal `max_reconnect_reached`
    pub max_reconnect_attempts: u32,
    /// Ack wait before the timeout payload fires
    pub ack_timeout: Duration,
    /// Interval between outbound heartbeats
    pub heartbeat_interval: Duration,
    /// Wait for a heartbeat answer before counting a miss
    pub heartbeat_grace: Duration,
    /// Offline queue capacity
    pub offline_queue_max: usize,
    /// TTL for parked emits
    pub offline_entry_ttl: Duration,
    /// Minimum payload bytes before DEFLATE (must match the broker)
    pub compression_threshold: usize,
    /// DEFLATE level 1..=9
    pub compression_level: u32,
    /// Pre-shared AES-256 key (must match the broker)
    pub encryption_key: Option<[u8; 32]>,
}

impl ClientConfig {
    /// Defaults for a broker at `url`, namespace `namespace`
    pub fn new(url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: namespace.into(),
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 10,
            ack_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(5),
            offline_queue_max: 1000,
            offline_entry_ttl: Duration::from_secs(300),
            compression_threshold: 1024,
            compression_level: 6,
            encryption_key: None,
        }
    }

    /// Effective WebSocket URL: base joined with the namespace path.
    /// The namespace always travels in the path, never as a query
    /// parameter.
    pub fn ws_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.namespace)
    }

    fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            compression_threshold: self.compression_threshold,
            compression_level: self.compression_level,
            encryption_key: self.encryption_key,
        }
    }
}

/// Client lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Never connected
    Idle,
    /// First connection attempt in flight
    Connecting,
    /// Transport up, frames flowing
    Open,
    /// Transport lost, backoff/retry in progress
    Reconnecting,
    /// Terminal: user close or retries exhausted
    Closed,
}

enum Command {
    Emit {
        event: String,
        payload: Value,
        ack_id: Option<u32>,
    },
    Ack {
        event: String,
        id: u32,
        payload: Value,
    },
    Close,
}

enum ConnectionEnd {
    UserClosed,
    Lost,
}

enum Inbound {
    Handled,
    Reply(Frame),
    PeerDisconnect,
}

enum SendOutcome {
    Sent,
    EncodeFailed,
    TransportLost,
}

struct ClientInner {
    config: ClientConfig,
    codec: FrameCodec,
    state: Mutex<ClientState>,
    handlers: RwLock<HashMap<String, ClientHandler>>,
    acks: AckRegistry,
    queue: Mutex<OfflineQueue>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    server_sid: Mutex<Option<String>>,
    user_closed: AtomicBool,
}

/// A skein client. Cheap to clone handles are not provided; wrap in an
/// `Arc` if multiple owners need it.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client; the transport is not touched until
    /// [`Client::connect`].
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if !config.namespace.starts_with('/') {
            return Err(ClientError::InvalidNamespace(config.namespace));
        }
        let codec = FrameCodec::new(config.codec_config());
        let acks = AckRegistry::new(config.ack_timeout);
        let queue = OfflineQueue::new(config.offline_queue_max, config.offline_entry_ttl);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                codec,
                state: Mutex::new(ClientState::Idle),
                handlers: RwLock::new(HashMap::new()),
                acks,
                queue: Mutex::new(queue),
                cmd_tx: Mutex::new(None),
                server_sid: Mutex::new(None),
                user_closed: AtomicBool::new(false),
            }),
        })
    }

    /// Start (or restart) the connection driver. Must be called from
    /// within a tokio runtime. No-op while a driver is already running.
    pub fn connect(&self) {
        let mut guard = lock(&self.inner.cmd_tx);
        if guard.is_some() {
            debug!("connect called while driver already running");
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        drop(guard);

        self.inner.user_closed.store(false, Ordering::SeqCst);
        self.inner.set_state(ClientState::Connecting);
        tokio::spawn(drive(Arc::clone(&self.inner), rx));
    }

    /// Close the connection. Terminal: no reconnection follows.
    pub fn disconnect(&self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);
        if let Some(tx) = lock(&self.inner.cmd_tx).clone() {
            let _ = tx.send(Command::Close);
        }
    }

    /// Register a handler for an event name. Lifecycle events
    /// (`connected`, `reconnected`, `disconnected`,
    /// `max_reconnect_reached`, `error`, `__rate-limited__`) use the same
    /// table.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Value, Option<AckReply>) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.into(), Arc::new(handler));
    }

    /// Emit an event. While the transport is not open the emit parks in
    /// the offline queue and is flushed, oldest first, on reconnect.
    pub fn emit(&self, event: impl Into<String>, payload: Value) {
        self.inner.emit(event.into(), payload, None);
    }

    /// Emit an event and register an ack callback. The callback fires
    /// exactly once: with the broker's reply, or with the `ack_timeout`
    /// payload. For parked emits the timeout clock starts at send time.
    pub fn emit_with_ack<F>(&self, event: impl Into<String>, payload: Value, callback: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let ack_id = self.inner.acks.register_unarmed(Box::new(callback));
        self.inner.emit(event.into(), payload, Some(ack_id));
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Socket id assigned by the broker, once the greeting arrived
    pub fn socket_id(&self) -> Option<String> {
        lock(&self.inner.server_sid).clone()
    }

    /// Number of emits parked in the offline queue
    pub fn queued_emits(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Number of acks awaiting a reply or timeout
    pub fn outstanding_acks(&self) -> usize {
        self.inner.acks.outstanding()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.config.url)
            .field("namespace", &self.inner.config.namespace)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn set_state(&self, next: ClientState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!(from = ?*state, to = ?next, "client state");
            *state = next;
        }
    }

    fn handler(&self, event: &str) -> Option<ClientHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned()
    }

    fn emit(&self, event: String, payload: Value, ack_id: Option<u32>) {
        let mut cmd = Command::Emit {
            event,
            payload,
            ack_id,
        };
        if self.state() == ClientState::Open {
            if let Some(tx) = lock(&self.cmd_tx).clone() {
                match tx.send(cmd) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(returned)) => cmd = returned,
                }
            }
        }
        if let Command::Emit {
            event,
            payload,
            ack_id,
        } = cmd
        {
            self.park(event, payload, ack_id);
        }
    }

    /// Park an emit in the offline queue
    fn park(&self, event: String, payload: Value, ack_id: Option<u32>) {
        let evicted = lock(&self.queue).push(QueuedEmit {
            event,
            payload,
            ack_id,
            queued_at: Instant::now(),
        });
        if let Some(evicted) = evicted {
            debug!(event = %evicted.event, "offline queue full, discarding oldest");
            if let Some(id) = evicted.ack_id {
                self.acks.fail(id);
            }
        }
    }

    /// Put entries back at the head of the queue, oldest first
    fn requeue_front(&self, entries: Vec<QueuedEmit>) {
        let evicted = lock(&self.queue).requeue_front(entries);
        for entry in evicted {
            if let Some(id) = entry.ack_id {
                self.acks.fail(id);
            }
        }
    }

    fn fire_local(&self, event: &str, payload: Value) {
        if let Some(handler) = self.handler(event) {
            self.invoke(&handler, event, payload, None);
        }
    }

    fn dispatch_event(self: &Arc<Self>, frame: Frame) {
        let Some(handler) = self.handler(&frame.event) else {
            debug!(event = %frame.event, "no handler, dropping event");
            return;
        };
        let ack = frame.ack_id.map(|id| {
            let cmd_tx = lock(&self.cmd_tx).clone();
            let event = frame.event.clone();
            AckReply::new(move |payload: Value| {
                if let Some(tx) = cmd_tx {
                    let _ = tx.send(Command::Ack { event, id, payload });
                }
            })
        });
        let event = frame.event.clone();
        self.invoke(&handler, &event, frame.payload.into_json(), ack);
    }

    fn invoke(&self, handler: &ClientHandler, event: &str, payload: Value, ack: Option<AckReply>) {
        let result = catch_unwind(AssertUnwindSafe(|| handler(payload, ack)));
        if result.is_err() {
            warn!(%event, "handler panicked");
        }
    }
}

async fn drive(inner: Arc<ClientInner>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let backoff = BackoffPolicy::new(inner.config.reconnect_delay);
    let url = inner.config.ws_url();
    let mut attempt: u32 = 0;

    'session: loop {
        if inner.user_closed.load(Ordering::SeqCst) {
            break;
        }
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                let reconnected = attempt > 0;
                attempt = 0;
                inner.set_state(ClientState::Open);
                info!(%url, "transport open");
                if reconnected {
                    inner.fire_local("reconnected", Value::Null);
                } else {
                    inner.fire_local("connected", Value::Null);
                }

                match run_connection(&inner, ws, &mut cmd_rx).await {
                    ConnectionEnd::UserClosed => {
                        inner.fire_local("disconnected", Value::Null);
                        break 'session;
                    }
                    ConnectionEnd::Lost => {
                        inner.fire_local("disconnected", Value::Null);
                    }
                }
            }
            Err(e) => {
                let code = connect_error_code(&e);
                warn!(%url, %code, "connect failed: {e}");
                inner.fire_local("error", json!({ "code": code, "message": e.to_string() }));
            }
        }

        attempt += 1;
        if attempt > inner.config.max_reconnect_attempts {
            warn!(
                attempts = attempt - 1,
                "reconnect attempts exhausted, giving up"
            );
            inner.fire_local("max_reconnect_reached", Value::Null);
            break 'session;
        }
        inner.set_state(ClientState::Reconnecting);
        let delay = backoff.delay_for(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");

        let wake = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => break,
                cmd = cmd_rx.recv() => match cmd {
                    // Emits racing the state change park like any offline emit
                    Some(Command::Emit { event, payload, ack_id }) => {
                        inner.park(event, payload, ack_id);
                    }
                    // Ack replies for a dead transport are dropped
                    Some(Command::Ack { .. }) => {}
                    Some(Command::Close) | None => break 'session,
                }
            }
        }
    }

    inner.set_state(ClientState::Closed);
    *lock(&inner.cmd_tx) = None;
    inner.acks.shutdown();
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    ws: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> ConnectionEnd {
    let (mut sink, mut stream) = ws.split();
    let ns = inner.config.namespace.clone();

    if flush_queue(inner, &mut sink).await.is_err() {
        return ConnectionEnd::Lost;
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.config.heartbeat_interval,
        inner.config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut hb_deadline: Option<tokio::time::Instant> = None;
    let mut missed: u32 = 0;

    loop {
        let pong_deadline = hb_deadline;
        let pong_wait = async move {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Emit { event, payload, ack_id }) => {
                    let frame = match ack_id {
                        Some(id) => Frame::event_with_ack(&ns, &event, id, payload),
                        None => Frame::event(&ns, &event, payload),
                    };
                    match send_frame(inner, &mut sink, &frame).await {
                        SendOutcome::Sent => {
                            if let Some(id) = ack_id {
                                inner.acks.arm(id);
                            }
                        }
                        SendOutcome::EncodeFailed => {
                            if let Some(id) = ack_id {
                                inner.acks.fail(id);
                            }
                        }
                        SendOutcome::TransportLost => {
                            let Frame { event, payload, .. } = frame;
                            inner.requeue_front(vec![QueuedEmit {
                                event,
                                payload: payload.into_json(),
                                ack_id,
                                queued_at: Instant::now(),
                            }]);
                            return ConnectionEnd::Lost;
                        }
                    }
                }
                Some(Command::Ack { event, id, payload }) => {
                    let frame = Frame::ack(&ns, &event, id, payload);
                    if matches!(send_frame(inner, &mut sink, &frame).await, SendOutcome::TransportLost) {
                        return ConnectionEnd::Lost;
                    }
                }
                Some(Command::Close) => {
                    let _ = send_frame(inner, &mut sink, &Frame::disconnect(&ns)).await;
                    let _ = sink.close().await;
                    return ConnectionEnd::UserClosed;
                }
                None => return ConnectionEnd::UserClosed,
            },
            msg = stream.next() => match msg {
                Some(Ok(WsMsg::Binary(data))) => {
                    match inner.codec.decode(&data) {
                        Ok(frame) => match handle_inbound(inner, frame, &mut missed, &mut hb_deadline) {
                            Inbound::Handled => {}
                            Inbound::Reply(reply) => {
                                if matches!(
                                    send_frame(inner, &mut sink, &reply).await,
                                    SendOutcome::TransportLost
                                ) {
                                    return ConnectionEnd::Lost;
                                }
                            }
                            Inbound::PeerDisconnect => {
                                let _ = sink.close().await;
                                return ConnectionEnd::Lost;
                            }
                        },
                        Err(e) => {
                            warn!("inbound frame rejected: {e}");
                        }
                    }
                }
                Some(Ok(WsMsg::Ping(_))) | Some(Ok(WsMsg::Pong(_))) => {}
                Some(Ok(WsMsg::Close(_))) | None => return ConnectionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("transport error: {e}");
                    return ConnectionEnd::Lost;
                }
            },
            _ = heartbeat.tick() => {
                if matches!(
                    send_frame(inner, &mut sink, &Frame::heartbeat(&ns)).await,
                    SendOutcome::TransportLost
                ) {
                    return ConnectionEnd::Lost;
                }
                if hb_deadline.is_none() {
                    hb_deadline = Some(tokio::time::Instant::now() + inner.config.heartbeat_grace);
                }
            },
            _ = pong_wait => {
                hb_deadline = None;
                missed += 1;
                if missed >= MAX_HEARTBEAT_MISSES {
                    warn!(misses = missed, "heartbeat unanswered, forcing reconnect");
                    return ConnectionEnd::Lost;
                }
            }
        }
    }
}

/// Flush the offline queue oldest-first. Expired entries fail their acks;
/// a transport failure puts the unsent tail back at the queue head.
async fn flush_queue(inner: &Arc<ClientInner>, sink: &mut WsSink) -> Result<(), ()> {
    let (fresh, expired) = lock(&inner.queue).drain(Instant::now());
    for entry in expired {
        debug!(event = %entry.event, "dropping expired queued emit");
        if let Some(id) = entry.ack_id {
            inner.acks.fail(id);
        }
    }
    if fresh.is_empty() {
        return Ok(());
    }
    info!(count = fresh.len(), "flushing offline queue");

    let mut pending = fresh.into_iter();
    while let Some(entry) = pending.next() {
        let frame = match entry.ack_id {
            Some(id) => Frame::event_with_ack(
                &inner.config.namespace,
                &entry.event,
                id,
                entry.payload.clone(),
            ),
            None => Frame::event(&inner.config.namespace, &entry.event, entry.payload.clone()),
        };
        match send_frame(inner, sink, &frame).await {
            SendOutcome::Sent => {
                if let Some(id) = entry.ack_id {
                    inner.acks.arm(id);
                }
            }
            SendOutcome::EncodeFailed => {
                if let Some(id) = entry.ack_id {
                    inner.acks.fail(id);
                }
            }
            SendOutcome::TransportLost => {
                let mut rest = vec![entry];
                rest.extend(pending);
                inner.requeue_front(rest);
                return Err(());
            }
        }
    }
    Ok(())
}

fn handle_inbound(
    inner: &Arc<ClientInner>,
    frame: Frame,
    missed: &mut u32,
    hb_deadline: &mut Option<tokio::time::Instant>,
) -> Inbound {
    match frame.frame_type {
        FrameType::HeartbeatAck => {
            *missed = 0;
            *hb_deadline = None;
            Inbound::Handled
        }
        FrameType::Heartbeat => Inbound::Reply(Frame::heartbeat_ack(&inner.config.namespace)),
        FrameType::Connect => {
            let sid = frame
                .payload
                .as_json()
                .and_then(|v| v.get("sid"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(sid) = sid {
                debug!(%sid, "broker assigned socket id");
                *lock(&inner.server_sid) = Some(sid);
            }
            Inbound::Handled
        }
        FrameType::Disconnect => Inbound::PeerDisconnect,
        FrameType::Error => {
            warn!(payload = ?frame.payload.as_json(), "broker error frame");
            inner.fire_local("error", frame.payload.into_json());
            Inbound::Handled
        }
        FrameType::Ack => {
            if let Some(id) = frame.ack_id {
                if !inner.acks.complete(id, frame.payload.into_json()) {
                    debug!(ack_id = id, "ack for unknown id");
                }
            }
            Inbound::Handled
        }
        FrameType::Event => {
            inner.dispatch_event(frame);
            Inbound::Handled
        }
    }
}

async fn send_frame(inner: &Arc<ClientInner>, sink: &mut WsSink, frame: &Frame) -> SendOutcome {
    match inner.codec.encode(frame) {
        Ok(bytes) => {
            if sink.send(WsMsg::Binary(bytes)).await.is_err() {
                SendOutcome::TransportLost
            } else {
                SendOutcome::Sent
            }
        }
        Err(e) => {
            warn!(event = %frame.event, "outbound encode failed: {e}");
            SendOutcome::EncodeFailed
        }
    }
}

/// Map a transport-level connect failure onto its stable error code
fn connect_error_code(error: &tokio_tungstenite::tungstenite::Error) -> &'static str {
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::Error;

    match error {
        Error::Http(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
            codes::MAX_CONNECTIONS
        }
        Error::Http(response) if response.status() == StatusCode::NOT_FOUND => {
            codes::UNKNOWN_NAMESPACE
        }
        Error::Http(_) | Error::Protocol(_) => codes::HANDSHAKE_FAILED,
        Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            codes::CONN_REFUSED
        }
        Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => codes::CONN_TIMEOUT,
        _ => codes::HANDSHAKE_FAILED,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ws_url_is_path_joined() {
        let config = ClientConfig::new("ws://127.0.0.1:4500", "/chat");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:4500/chat");

        // Trailing slash on the base does not double up
        let config = ClientConfig::new("ws://127.0.0.1:4500/", "/chat");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:4500/chat");

        // Root namespace
        let config = ClientConfig::new("ws://127.0.0.1:4500", "/");
        assert_eq!(config.ws_url(), "ws://127.0.0.1:4500/");
    }

    #[test]
    fn test_namespace_must_start_with_slash() {
        let config = ClientConfig::new("ws://127.0.0.1:4500", "chat");
        assert!(matches!(
            Client::new(config),
            Err(ClientError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn test_new_client_starts_idle() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:4500", "/")).unwrap();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(client.socket_id().is_none());
        assert_eq!(client.queued_emits(), 0);
    }

    #[test]
    fn test_emit_before_connect_parks_in_queue() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:4500", "/chat")).unwrap();
        client.emit("a", json!(1));
        client.emit("b", json!(2));
        assert_eq!(client.queued_emits(), 2);
    }

    #[test]
    fn test_queued_ack_emit_registers_unarmed() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:4500", "/chat")).unwrap();
        client.emit_with_ack("save", json!({"k": 1}), |_payload| {});
        assert_eq!(client.queued_emits(), 1);
        // Unarmed: no timer runs while the frame is parked
        assert_eq!(client.outstanding_acks(), 1);
    }

    #[test]
    fn test_connect_error_codes() {
        use tokio_tungstenite::tungstenite::Error;

        let refused = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(connect_error_code(&refused), "conn_refused");

        let timed_out = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(connect_error_code(&timed_out), "conn_timeout");

        let other = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "odd"));
        assert_eq!(connect_error_code(&other), "handshake_failed");
    }

    #[test]
    fn test_queue_overflow_fails_evicted_ack() {
        let mut config = ClientConfig::new("ws://127.0.0.1:4500", "/chat");
        config.offline_queue_max = 1;
        let client = Client::new(config).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        client.emit_with_ack("first", json!(1), move |payload| {
            let _ = tx.send(payload);
        });
        client.emit("second", json!(2));

        // "first" was evicted; its callback fired with the timeout payload
        let payload = rx.recv().unwrap();
        assert_eq!(payload["error"], "ack_timeout");
        assert_eq!(client.queued_emits(), 1);
        assert_eq!(client.outstanding_acks(), 0);
    }
}
