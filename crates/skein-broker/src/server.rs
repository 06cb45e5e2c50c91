//! Broker assembly and serving

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use dashmap::DashMap;
use serde_json::Value;
use skein_protocol::ack::AckCallback;
use skein_protocol::{AckReply, FrameCodec};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::namespace::{Namespace, NamespaceRegistry};
use crate::rate_limit::RateLimitConfig;
use crate::socket::{Socket, SocketId};

/// Interval between sweeper log lines
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A broker instance: namespace registry, socket directory, codec, and
/// counters. Namespaces and handlers are registered before
/// [`Broker::run`]; the runtime then dispatches frames until shutdown.
pub struct Broker {
    config: BrokerConfig,
    codec: FrameCodec,
    rate_limit: RateLimitConfig,
    registry: NamespaceRegistry,
    sockets: DashMap<SocketId, Arc<Socket>>,
    metrics: Arc<BrokerMetrics>,
}

impl Broker {
    /// Build a broker from a validated copy of `config`
    pub fn new(mut config: BrokerConfig) -> Arc<Self> {
        config.validate();
        let codec = FrameCodec::new(config.codec_config());
        let rate_limit = config.rate_limit_config();
        Arc::new(Self {
            config,
            codec,
            rate_limit,
            registry: NamespaceRegistry::new(),
            sockets: DashMap::new(),
            metrics: Arc::new(BrokerMetrics::default()),
        })
    }

    /// Create (or fetch) the namespace for `path`. Call before serving;
    /// connections to unregistered paths are rejected.
    pub fn namespace(&self, path: &str) -> Result<Arc<Namespace>, BrokerError> {
        self.registry.create(path)
    }

    /// Register a server-level handler, consulted when neither the
    /// socket's namespace nor the socket itself has one for the event.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Socket>, Value, Option<AckReply>) + Send + Sync + 'static,
    {
        self.registry.root().on(event, handler);
    }

    /// Emit directly to one socket anywhere on the broker
    pub fn to(&self, id: &SocketId) -> SocketEmitter {
        SocketEmitter {
            socket: self.socket(id),
            id: id.clone(),
        }
    }

    /// Look up a connected socket by id
    pub fn socket(&self, id: &SocketId) -> Option<Arc<Socket>> {
        self.sockets.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of connected sockets
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Broker counters
    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    pub(crate) fn metrics_arc(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub(crate) fn rate_limit_config(&self) -> RateLimitConfig {
        self.rate_limit.clone()
    }

    pub(crate) fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    pub(crate) fn register_socket(&self, socket: Arc<Socket>) {
        self.sockets.insert(socket.id().clone(), socket);
    }

    pub(crate) fn unregister_socket(&self, id: &SocketId) {
        self.sockets.remove(id);
    }

    /// The HTTP router serving upgrades and `/health`
    pub fn router(self: &Arc<Self>) -> Router {
        crate::ws::router(Arc::clone(self))
    }

    /// Serve on an already-bound listener until ctrl-c. Useful for tests
    /// binding port 0.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&self)));

        let router = self.router();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        sweeper.abort();
        result.map_err(Into::into)
    }

    /// Bind the configured address and serve until ctrl-c
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, namespaces = self.registry.len(), "broker listening");
        self.serve(listener).await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("namespaces", &self.registry.len())
            .field("sockets", &self.sockets.len())
            .finish_non_exhaustive()
    }
}

/// Emit handle for a single socket, resolved at call time
pub struct SocketEmitter {
    socket: Option<Arc<Socket>>,
    id: SocketId,
}

impl SocketEmitter {
    /// Emit to the socket; a vanished socket is a logged no-op
    pub fn emit(&self, event: &str, data: Value) {
        match &self.socket {
            Some(socket) => socket.emit(event, data),
            None => warn!(socket = %self.id, %event, "emit to unknown socket"),
        }
    }

    /// Emit with an ack callback; a vanished socket fails the callback
    /// with the timeout payload immediately.
    pub fn emit_with_ack(&self, event: &str, data: Value, callback: AckCallback) {
        match &self.socket {
            Some(socket) => socket.emit_with_ack(event, data, callback),
            None => {
                warn!(socket = %self.id, %event, "ack emit to unknown socket");
                callback(skein_protocol::ack::timeout_payload());
            }
        }
    }

    /// Whether the target socket was connected at lookup time
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

async fn sweep_loop(broker: Arc<Broker>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let snap = broker.metrics.snapshot();
        tracing::debug!(
            active = snap.active_connections,
            frames_in = snap.frames_in,
            frames_out = snap.frames_out,
            dropped = snap.frames_dropped,
            rate_limited = snap.rate_limit_denials,
            "broker stats"
        );
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; serve until the task is dropped
        futures::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
