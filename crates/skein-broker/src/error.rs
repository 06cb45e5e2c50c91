//! Broker error types

use thiserror::Error;

/// Broker-layer errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Namespace path does not start with `/`
    #[error("invalid namespace path '{0}': must start with '/'")]
    InvalidNamespace(String),
    /// Socket lifecycle violation
    #[error("invalid socket state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },
    /// Configuration file could not be read or parsed
    #[error("config error: {0}")]
    Config(String),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
