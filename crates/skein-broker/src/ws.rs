//! WebSocket endpoint and per-connection runtime
//!
//! Runs an axum HTTP server that upgrades connections to WebSocket. The
//! upgrade URL path (query stripped) names the namespace; unknown paths
//! are rejected before any socket state is allocated, as are upgrades
//! past the admission cap.
//!
//! Each accepted connection gets a reader task that preserves the
//! sender's frame order through decode, rate limiting, middleware, and
//! dispatch, plus a writer task that serialises every outbound frame for
//! the socket. Fan-out from handlers lands in other sockets' writer
//! queues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMsg, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use skein_protocol::error::codes;
use skein_protocol::frame::{RATE_LIMITED_EVENT, RESERVED_EVENTS};
use skein_protocol::{AckRegistry, AckReply, Frame, FrameType};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::metrics::BrokerMetrics;
use crate::namespace::{EventHandler, Namespace};
use crate::rate_limit::{Admission, SocketRateLimiter};
use crate::server::Broker;
use crate::socket::{Socket, SocketState};

/// Maximum WebSocket message size: the payload cap plus header room
const MAX_WS_MESSAGE_SIZE: usize = 17 * 1024 * 1024;

/// Frames a socket's writer queue holds before overflow drops
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Wait for a heartbeat-probe answer
const PROBE_GRACE: Duration = Duration::from_secs(5);

/// Probes sent before the socket is declared lost
const MAX_HEARTBEAT_PROBES: u32 = 3;

/// Why a connection's read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Peer closed or sent a Disconnect frame
    PeerClosed,
    /// Transport error
    Transport,
    /// Inbound frame failed to decode
    FrameError,
    /// Heartbeat probes went unanswered
    ConnectionLost,
}

/// Build the axum router for a broker: WebSocket upgrades on every
/// namespace path plus a `/health` check.
///
/// CORS is permissive; the broker is a message forwarding service and
/// origin checking is not its access-control boundary.
pub(crate) fn router(broker: Arc<Broker>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .fallback(upgrade_handler)
        .layer(cors)
        .with_state(broker)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
///
/// Admission order: namespace lookup (404 `unknown_namespace`), then the
/// connection cap (503 `max_connections`). The cap is taken with a
/// compare-and-swap, so concurrent upgrades cannot overshoot it.
async fn upgrade_handler(
    State(broker): State<Arc<Broker>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_string();
    let Some(namespace) = broker.registry().get(&path) else {
        debug!(%path, "upgrade rejected: unknown namespace");
        broker.metrics().incr_rejected();
        return (StatusCode::NOT_FOUND, codes::UNKNOWN_NAMESPACE).into_response();
    };

    let Some(guard) = ConnectionGuard::try_acquire(broker.metrics_arc(), broker.config().max_connections)
    else {
        warn!(%path, "upgrade rejected: connection cap reached");
        return (StatusCode::SERVICE_UNAVAILABLE, codes::MAX_CONNECTIONS).into_response();
    };

    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_connection(socket, broker, namespace, guard))
        .into_response()
}

/// Holds one slot of the active-connection gauge; released on drop so a
/// vanished upgrade can never leak the slot.
struct ConnectionGuard {
    metrics: Arc<BrokerMetrics>,
}

impl ConnectionGuard {
    fn try_acquire(metrics: Arc<BrokerMetrics>, max: usize) -> Option<Self> {
        metrics
            .try_acquire_connection(max)
            .then_some(Self { metrics })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.release_connection();
    }
}

/// Handle one accepted WebSocket connection end to end
async fn handle_connection(
    ws: WebSocket,
    broker: Arc<Broker>,
    namespace: Arc<Namespace>,
    _guard: ConnectionGuard,
) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
    let socket = Socket::new(
        Arc::clone(&namespace),
        out_tx,
        AckRegistry::new(broker.config().ack_timeout()),
        SocketRateLimiter::new(broker.rate_limit_config()),
        broker.metrics_arc(),
    );

    // Writer task: the only place this socket's sink is touched, so
    // outbound frames stay ordered per receiver.
    let codec = broker.codec().clone();
    let writer_metrics = broker.metrics_arc();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match codec.encode(&frame) {
                Ok(bytes) => {
                    if ws_sink.send(WsMsg::Binary(Bytes::from(bytes))).await.is_err() {
                        break;
                    }
                    writer_metrics.incr_frames_out();
                }
                Err(e) => {
                    warn!(event = %frame.event, "outbound encode failed: {e}");
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    if socket.transition(SocketState::Open).is_err() {
        return;
    }
    namespace.attach(Arc::clone(&socket));
    broker.register_socket(Arc::clone(&socket));
    info!(socket = %socket.id(), namespace = %namespace.path(), "socket connected");

    socket.send(Frame::connect(namespace.path(), socket.id().as_str()));
    dispatch_lifecycle(&broker, &namespace, &socket, "connected");

    let reason = read_loop(&broker, &namespace, &socket, &mut ws_stream).await;
    debug!(socket = %socket.id(), ?reason, "read loop ended");

    teardown(&broker, &namespace, &socket);

    // Let the writer drain whatever was queued (final error frames
    // included), then wait for it to close the sink.
    socket.close_outbound();
    let _ = writer.await;
}

/// Per-connection read loop with idle-probe heartbeating
async fn read_loop(
    broker: &Arc<Broker>,
    namespace: &Arc<Namespace>,
    socket: &Arc<Socket>,
    ws_stream: &mut SplitStream<WebSocket>,
) -> CloseReason {
    let connection_timeout = broker.config().connection_timeout();
    let mut probes_sent: u32 = 0;
    let mut deadline = tokio::time::Instant::now() + connection_timeout;

    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(WsMsg::Binary(data))) => {
                    socket.touch();
                    probes_sent = 0;
                    deadline = tokio::time::Instant::now() + connection_timeout;

                    match broker.codec().decode(&data) {
                        Ok(frame) => {
                            broker.metrics().incr_frames_in();
                            match dispatch_frame(broker, namespace, socket, frame) {
                                Some(reason) => return reason,
                                None => {}
                            }
                        }
                        Err(e) => {
                            broker.metrics().incr_decode_errors();
                            warn!(socket = %socket.id(), "inbound frame rejected: {e}");
                            socket.send(Frame::error(
                                namespace.path(),
                                e.code(),
                                &e.to_string(),
                                None,
                            ));
                            return CloseReason::FrameError;
                        }
                    }
                }
                Some(Ok(WsMsg::Ping(_))) | Some(Ok(WsMsg::Pong(_))) => {
                    socket.touch();
                }
                Some(Ok(WsMsg::Close(_))) | None => return CloseReason::PeerClosed,
                Some(Ok(_)) => {
                    debug!(socket = %socket.id(), "ignoring non-binary message");
                }
                Some(Err(e)) => {
                    debug!(socket = %socket.id(), "transport error: {e}");
                    return CloseReason::Transport;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                if probes_sent >= MAX_HEARTBEAT_PROBES {
                    warn!(socket = %socket.id(), "heartbeat probes unanswered, closing");
                    socket.send(Frame::error(
                        namespace.path(),
                        codes::CONNECTION_LOST,
                        "no heartbeat answer",
                        None,
                    ));
                    return CloseReason::ConnectionLost;
                }
                probes_sent += 1;
                socket.send(Frame::heartbeat(namespace.path()));
                deadline = tokio::time::Instant::now() + PROBE_GRACE;
            }
        }
    }
}

/// Route one decoded frame. Returns a close reason for frames that end
/// the connection.
fn dispatch_frame(
    broker: &Arc<Broker>,
    namespace: &Arc<Namespace>,
    socket: &Arc<Socket>,
    frame: Frame,
) -> Option<CloseReason> {
    match frame.frame_type {
        FrameType::Heartbeat => {
            socket.send(Frame::heartbeat_ack(namespace.path()));
            None
        }
        // Inbound activity already reset the probe clock
        FrameType::HeartbeatAck => None,
        FrameType::Disconnect => Some(CloseReason::PeerClosed),
        FrameType::Connect => {
            debug!(socket = %socket.id(), "ignoring client connect frame");
            None
        }
        FrameType::Error => {
            warn!(socket = %socket.id(), payload = ?frame.payload.as_json(), "peer error frame");
            None
        }
        FrameType::Ack => {
            let Some(id) = frame.ack_id else {
                debug!(socket = %socket.id(), code = codes::ACK_INVALID, "ack frame without id");
                return None;
            };
            if !socket.acks().complete(id, frame.payload.into_json()) {
                debug!(socket = %socket.id(), ack_id = id, code = codes::ACK_UNKNOWN_ID, "ack for unknown id");
            }
            None
        }
        FrameType::Event => {
            dispatch_event(broker, namespace, socket, frame);
            None
        }
    }
}

/// Rate-limit, run middleware, and invoke the handler for one event
fn dispatch_event(
    broker: &Arc<Broker>,
    namespace: &Arc<Namespace>,
    socket: &Arc<Socket>,
    frame: Frame,
) {
    let event = frame.event.clone();

    // Runtime-owned names cannot be injected from the wire
    if RESERVED_EVENTS.contains(&event.as_str()) {
        warn!(socket = %socket.id(), %event, "dropping wire event under reserved name");
        return;
    }

    match socket.admit(&event, Instant::now()) {
        Admission::Allowed => {}
        Admission::Denied { scope, retry_after } => {
            debug!(socket = %socket.id(), %event, code = scope.code(), "rate limited");
            broker.metrics().incr_rate_limit_denials();
            socket.send(Frame::event(
                namespace.path(),
                RATE_LIMITED_EVENT,
                json!({
                    "event": event,
                    "retryAfterMs": retry_after.as_millis() as u64,
                }),
            ));
            return;
        }
    }

    let data = frame.payload.into_json();

    if let Err(reject) = namespace.run_middleware(socket, &event, &data) {
        debug!(socket = %socket.id(), %event, code = %reject.code, "middleware rejected event");
        socket.send(Frame::error(
            namespace.path(),
            &reject.code,
            &reject.message,
            Some(&event),
        ));
        return;
    }

    // Lookup order: namespace handler, then per-socket handler, then the
    // server-level table; otherwise the event is silently dropped.
    let handler = namespace
        .handler(&event)
        .or_else(|| socket.handler(&event))
        .or_else(|| broker.registry().root().handler(&event));
    let Some(handler) = handler else {
        debug!(socket = %socket.id(), %event, "no handler, dropping event");
        return;
    };

    let ack = frame.ack_id.map(|id| {
        let sender = socket.sender();
        let ns_path = namespace.path().to_string();
        let ack_event = event.clone();
        AckReply::new(move |payload: Value| {
            if let Some(sender) = sender {
                let _ = sender.try_send(Frame::ack(ns_path, ack_event, id, payload));
            }
        })
    });

    invoke_handler(broker, socket, &event, &handler, data, ack);
}

/// Invoke a runtime-synthesized lifecycle event (`connected`,
/// `disconnected`) through the normal lookup order.
fn dispatch_lifecycle(
    broker: &Arc<Broker>,
    namespace: &Arc<Namespace>,
    socket: &Arc<Socket>,
    event: &str,
) {
    let handler = namespace
        .handler(event)
        .or_else(|| socket.handler(event))
        .or_else(|| broker.registry().root().handler(event));
    if let Some(handler) = handler {
        invoke_handler(broker, socket, event, &handler, Value::Null, None);
    }
}

/// Run a handler, isolating panics to this invocation
fn invoke_handler(
    broker: &Arc<Broker>,
    socket: &Arc<Socket>,
    event: &str,
    handler: &EventHandler,
    data: Value,
    ack: Option<AckReply>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        handler(Arc::clone(socket), data, ack);
    }));
    if result.is_err() {
        broker.metrics().incr_handler_panics();
        error!(socket = %socket.id(), %event, "handler panicked; socket stays open");
    }
}

/// Detach a socket from everything it touched
fn teardown(broker: &Arc<Broker>, namespace: &Arc<Namespace>, socket: &Arc<Socket>) {
    if socket.transition(SocketState::Closing).is_err() {
        return;
    }

    let joined = socket.take_rooms();
    namespace.rooms().cleanup_socket(socket.id(), joined);
    namespace.detach(socket.id());
    broker.unregister_socket(socket.id());

    dispatch_lifecycle(broker, namespace, socket, "disconnected");

    // Sender-side ack timers owned by this socket are cancelled; their
    // callbacks fire once with the timeout payload. Acks other sockets
    // hold against this one keep their own timers.
    socket.acks().shutdown();

    let _ = socket.transition(SocketState::Closed);
    info!(socket = %socket.id(), namespace = %namespace.path(), "socket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint_returns_200() {
        let broker = Broker::new(BrokerConfig::default());
        let app = broker.router();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_headers_present() {
        let broker = Broker::new(BrokerConfig::default());
        let app = broker.router();

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/health")
            .header("Origin", "http://example.com")
            .header("Access-Control-Request-Method", "GET")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        let cors_header = response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap_or(""));
        assert_eq!(cors_header, Some("*"));
    }

    #[tokio::test]
    async fn test_plain_get_on_namespace_is_not_a_socket() {
        let broker = Broker::new(BrokerConfig::default());
        broker.namespace("/chat").unwrap();
        let app = broker.router();

        // No upgrade headers: the request never becomes a socket and no
        // connection slot is taken.
        let request = Request::builder()
            .uri("/chat")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(broker.metrics().snapshot().active_connections, 0);
    }
}
