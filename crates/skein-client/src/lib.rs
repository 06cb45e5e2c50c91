//! Skein client runtime
//!
//! A WebSocket client speaking the skein wire protocol: same codec as the
//! broker, reconnection with capped exponential backoff, heartbeat
//! liveness, ack callbacks, and a bounded offline queue flushed on
//! reconnect.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod queue;

pub use backoff::BackoffPolicy;
pub use client::{Client, ClientConfig, ClientState};
pub use error::ClientError;
