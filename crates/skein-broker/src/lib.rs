//! Skein broker server
//!
//! Accepts WebSocket connections, multiplexes them by namespace and room,
//! and routes application events between sockets with optional
//! acknowledgements, sliding-window rate limiting, and heartbeat-based
//! liveness. Handlers are registered per namespace before serving:
//!
//! ```no_run
//! use skein_broker::{Broker, BrokerConfig};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let broker = Broker::new(BrokerConfig::default());
//! let chat = broker.namespace("/chat")?;
//! chat.on("say", |socket, data, _ack| {
//!     socket.to("lobby").emit("said", json!({ "from": socket.id().as_str(), "data": data }));
//! });
//! broker.run().await
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod namespace;
pub mod rate_limit;
pub mod rooms;
pub mod server;
pub mod socket;
mod ws;

pub use config::{BrokerConfig, EventLimit};
pub use error::BrokerError;
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use namespace::{Namespace, Reject};
pub use server::{Broker, SocketEmitter};
pub use socket::{Socket, SocketId, SocketState};
