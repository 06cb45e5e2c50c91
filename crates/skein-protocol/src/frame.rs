//! Frame model for the skein wire protocol

use serde_json::{json, Value};

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload length after decryption and decompression (16 MiB)
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Event name used for rate-limit denial notifications
pub const RATE_LIMITED_EVENT: &str = "__rate-limited__";

/// Event names owned by the runtime; applications must not register
/// handlers under these names.
pub const RESERVED_EVENTS: &[&str] = &[
    "connected",
    "disconnected",
    "error",
    RATE_LIMITED_EVENT,
    "__heartbeat__",
    "__heartbeat-ack__",
];

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Connection greeting carrying the assigned socket id
    Connect = 1,
    /// Orderly close announced by either peer
    Disconnect = 2,
    /// Application event
    Event = 3,
    /// Reply correlated to an ack-requesting frame
    Ack = 4,
    /// Error notification with a stable code
    Error = 5,
    /// Liveness probe
    Heartbeat = 6,
    /// Answer to a liveness probe
    HeartbeatAck = 7,
}

impl FrameType {
    /// Parse a wire type byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Connect),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Event),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Heartbeat),
            7 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }
}

/// Flag bits in the frame header
pub mod flags {
    /// Payload is DEFLATE-compressed
    pub const COMPRESSED: u8 = 0b1000_0000;
    /// Payload is AES-256-CBC encrypted
    pub const ENCRYPTED: u8 = 0b0100_0000;
    /// Sender expects an ACK carrying this frame's ack id
    pub const ACK_REQUESTED: u8 = 0b0010_0000;
    /// Payload is raw bytes rather than JSON text
    pub const BINARY: u8 = 0b0001_0000;
    /// Bits 0-3 must be zero on the wire
    pub const RESERVED: u8 = 0b0000_1111;
}

/// Frame payload: structured JSON by default, raw bytes when the sender
/// set the binary flag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON value, serialized as compact text on the wire
    Json(Value),
    /// Pre-framed application bytes
    Binary(Vec<u8>),
}

impl Payload {
    /// Empty JSON payload
    pub fn null() -> Self {
        Self::Json(Value::Null)
    }

    /// Whether this payload travels with the binary flag set
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Borrow the JSON value, if this is a JSON payload
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Binary(_) => None,
        }
    }

    /// Take the JSON value, substituting `Null` for binary payloads
    pub fn into_json(self) -> Value {
        match self {
            Self::Json(v) => v,
            Self::Binary(_) => Value::Null,
        }
    }
}

/// A single wire message
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame type byte
    pub frame_type: FrameType,
    /// Namespace path the frame belongs to
    pub namespace: String,
    /// Event name; empty for control frames
    pub event: String,
    /// Correlation id, present iff the sender requested an ack or this
    /// frame is the ack itself
    pub ack_id: Option<u32>,
    /// Application payload
    pub payload: Payload,
}

impl Frame {
    /// An application event frame
    pub fn event(namespace: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: FrameType::Event,
            namespace: namespace.into(),
            event: event.into(),
            ack_id: None,
            payload: Payload::Json(payload),
        }
    }

    /// An event frame that requests an acknowledgement
    pub fn event_with_ack(
        namespace: impl Into<String>,
        event: impl Into<String>,
        ack_id: u32,
        payload: Value,
    ) -> Self {
        Self {
            frame_type: FrameType::Event,
            namespace: namespace.into(),
            event: event.into(),
            ack_id: Some(ack_id),
            payload: Payload::Json(payload),
        }
    }

    /// The ack reply correlated to `ack_id`
    pub fn ack(
        namespace: impl Into<String>,
        event: impl Into<String>,
        ack_id: u32,
        payload: Value,
    ) -> Self {
        Self {
            frame_type: FrameType::Ack,
            namespace: namespace.into(),
            event: event.into(),
            ack_id: Some(ack_id),
            payload: Payload::Json(payload),
        }
    }

    /// An error frame with a stable code, human message, and the offending
    /// event name when one exists
    pub fn error(
        namespace: impl Into<String>,
        code: &str,
        message: &str,
        event: Option<&str>,
    ) -> Self {
        let payload = match event {
            Some(ev) => json!({ "code": code, "message": message, "event": ev }),
            None => json!({ "code": code, "message": message }),
        };
        Self {
            frame_type: FrameType::Error,
            namespace: namespace.into(),
            event: "error".to_string(),
            ack_id: None,
            payload: Payload::Json(payload),
        }
    }

    /// Connection greeting carrying the assigned socket id
    pub fn connect(namespace: impl Into<String>, socket_id: &str) -> Self {
        Self {
            frame_type: FrameType::Connect,
            namespace: namespace.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::Json(json!({ "sid": socket_id })),
        }
    }

    /// Orderly close announcement
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Disconnect,
            namespace: namespace.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::null(),
        }
    }

    /// Liveness probe
    pub fn heartbeat(namespace: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            namespace: namespace.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::null(),
        }
    }

    /// Answer to a liveness probe
    pub fn heartbeat_ack(namespace: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::HeartbeatAck,
            namespace: namespace.into(),
            event: String::new(),
            ack_id: None,
            payload: Payload::null(),
        }
    }

    /// Whether this frame asks its receiver for an acknowledgement
    pub fn wants_ack(&self) -> bool {
        self.ack_id.is_some() && self.frame_type != FrameType::Ack
    }
}
