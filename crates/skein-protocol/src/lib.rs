//! Skein wire protocol
//!
//! Defines the binary frame format shared by the broker and the client:
//! header layout, payload serialization, DEFLATE compression above a
//! threshold, optional AES-256-CBC payload encryption, and the
//! acknowledgement correlator both peers use to match replies to requests.

#![forbid(unsafe_code)]

pub mod ack;
pub mod codec;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod frame;

pub use ack::{AckRegistry, AckReply};
pub use codec::{CodecConfig, FrameCodec};
pub use error::ProtocolError;
pub use frame::{Frame, FrameType, Payload};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
