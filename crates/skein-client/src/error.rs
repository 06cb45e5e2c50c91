//! Client error types

use thiserror::Error;

/// Client-layer errors. Transport failures are not surfaced here; they
/// feed the reconnection state machine instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Namespace path does not start with `/`
    #[error("invalid namespace path '{0}': must start with '/'")]
    InvalidNamespace(String),
}
