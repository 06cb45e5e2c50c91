//! Protocol error types

use thiserror::Error;

/// Stable error codes carried in ERROR frames, rejection bodies, and
/// local error events. Peers match on these strings, never on messages.
pub mod codes {
    /// TCP connection refused
    pub const CONN_REFUSED: &str = "conn_refused";
    /// Connection attempt timed out
    pub const CONN_TIMEOUT: &str = "conn_timeout";
    /// WebSocket handshake failed
    pub const HANDSHAKE_FAILED: &str = "handshake_failed";
    /// Middleware or upgrade authentication failure
    pub const AUTH_FAILED: &str = "auth_failed";
    /// Admission cap reached
    pub const MAX_CONNECTIONS: &str = "max_connections";
    /// Heartbeat probes went unanswered
    pub const CONNECTION_LOST: &str = "connection_lost";
    /// Frame header malformed or truncated
    pub const FRAME_INVALID: &str = "frame_invalid";
    /// Payload failed to inflate or exceeded inflate bounds
    pub const DECOMPRESS_FAILED: &str = "decompress_failed";
    /// Payload failed to decrypt
    pub const DECRYPT_FAILED: &str = "decrypt_failed";
    /// Payload exceeds the decoded size cap
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    /// Payload bytes are not valid JSON
    pub const PAYLOAD_PARSE_FAILED: &str = "payload_parse_failed";
    /// Upgrade path names no registered namespace
    pub const UNKNOWN_NAMESPACE: &str = "unknown_namespace";
    /// Default window refused the frame
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Per-event window refused the frame
    pub const EVENT_RATE_LIMITED: &str = "event_rate_limited";
    /// Ack never arrived within the timeout
    pub const ACK_TIMEOUT: &str = "ack_timeout";
    /// Ack frame without a usable id
    pub const ACK_INVALID: &str = "ack_invalid";
    /// Ack id matches no outstanding entry
    pub const ACK_UNKNOWN_ID: &str = "ack_unknown_id";
}

/// Protocol-layer errors
///
/// Each variant maps to the stable code string carried in ERROR frames,
/// via [`ProtocolError::code`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame header is malformed, truncated, or carries an unknown version
    #[error("invalid frame: {0}")]
    FrameInvalid(String),
    /// Compressed payload failed to inflate or exceeded the inflate bounds
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
    /// Encrypted payload failed to decrypt
    #[error("decryption failed: {0}")]
    DecryptFailed(String),
    /// Payload exceeds the decoded size cap
    #[error("payload too large: {actual} bytes (max {max})")]
    PayloadTooLarge {
        /// Observed payload length
        actual: usize,
        /// Configured maximum
        max: usize,
    },
    /// Payload bytes are not the JSON the flags promised
    #[error("payload parse failed: {0}")]
    PayloadParseFailed(String),
    /// Payload could not be compressed
    #[error("compression failed: {0}")]
    CompressFailed(String),
    /// Payload could not be encrypted
    #[error("encryption failed: {0}")]
    EncryptFailed(String),
}

impl ProtocolError {
    /// Stable wire code for ERROR frames
    pub fn code(&self) -> &'static str {
        match self {
            Self::FrameInvalid(_) => codes::FRAME_INVALID,
            Self::DecompressFailed(_) => codes::DECOMPRESS_FAILED,
            Self::DecryptFailed(_) => codes::DECRYPT_FAILED,
            Self::PayloadTooLarge { .. } => codes::PAYLOAD_TOO_LARGE,
            Self::PayloadParseFailed(_) => codes::PAYLOAD_PARSE_FAILED,
            Self::CompressFailed(_) => "compress_failed",
            Self::EncryptFailed(_) => "encrypt_failed",
        }
    }
}
