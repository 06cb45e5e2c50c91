//! Binary codec for skein frames
//!
//! Wire layout:
//!
//! ```text
//! [ver:1][type:1][flags:1][ns_len:2 BE][ns:utf8]
//!         [evt_len:2 BE][evt:utf8]
//!         [ack_id:4 BE]?        // present iff ACK_REQUESTED or type == Ack
//!         [payload_len:4 BE][payload:bytes]
//! ```
//!
//! The payload is compact JSON unless the binary flag is set. Payloads
//! longer than the compression threshold are DEFLATE-compressed; when a
//! pre-shared key is configured, the (possibly compressed) payload is
//! AES-256-CBC encrypted. Compression always happens before encryption;
//! decoding reverses encryption, then compression.

use bytes::{Buf, BufMut, BytesMut};

use crate::compress;
use crate::crypto;
use crate::error::ProtocolError;
use crate::frame::{flags, Frame, FrameType, Payload, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
use crate::Result;

/// Codec configuration shared by both peers of a connection
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum payload length before DEFLATE kicks in
    pub compression_threshold: usize,
    /// DEFLATE level 1..=9
    pub compression_level: u32,
    /// Pre-shared AES-256 key; `None` disables encryption
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            compression_level: 6,
            encryption_key: None,
        }
    }
}

/// Stateless encoder/decoder over byte buffers
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: CodecConfig,
}

impl FrameCodec {
    /// Create a codec with the given configuration
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Encode a frame into a fresh buffer
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.namespace.len() > u16::MAX as usize {
            return Err(ProtocolError::FrameInvalid(format!(
                "namespace path too long: {} bytes",
                frame.namespace.len()
            )));
        }
        if frame.event.len() > u16::MAX as usize {
            return Err(ProtocolError::FrameInvalid(format!(
                "event name too long: {} bytes",
                frame.event.len()
            )));
        }
        if frame.frame_type == FrameType::Ack && frame.ack_id.is_none() {
            return Err(ProtocolError::FrameInvalid(
                "ack frame without an ack id".to_string(),
            ));
        }

        let mut frame_flags = 0u8;

        let mut payload = match &frame.payload {
            Payload::Json(value) => serde_json::to_vec(value)
                .map_err(|e| ProtocolError::PayloadParseFailed(e.to_string()))?,
            Payload::Binary(bytes) => {
                frame_flags |= flags::BINARY;
                bytes.clone()
            }
        };
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                actual: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        if payload.len() > self.config.compression_threshold {
            payload = compress::deflate(&payload, self.config.compression_level)?;
            frame_flags |= flags::COMPRESSED;
        }
        if let Some(key) = &self.config.encryption_key {
            payload = crypto::seal(key, &payload)?;
            frame_flags |= flags::ENCRYPTED;
        }

        let ack_id = match frame.frame_type {
            FrameType::Ack => frame.ack_id,
            _ => {
                if frame.ack_id.is_some() {
                    frame_flags |= flags::ACK_REQUESTED;
                }
                frame.ack_id
            }
        };

        let mut buf = BytesMut::with_capacity(
            3 + 2 + frame.namespace.len() + 2 + frame.event.len() + 4 + 4 + payload.len(),
        );
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(frame.frame_type as u8);
        buf.put_u8(frame_flags);
        buf.put_u16(frame.namespace.len() as u16);
        buf.put_slice(frame.namespace.as_bytes());
        buf.put_u16(frame.event.len() as u16);
        buf.put_slice(frame.event.as_bytes());
        if let Some(id) = ack_id {
            buf.put_u32(id);
        }
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.to_vec())
    }

    /// Decode a single frame from `data`. The buffer must contain exactly
    /// one frame; trailing bytes are a framing error (the WebSocket layer
    /// already delimits messages).
    pub fn decode(&self, data: &[u8]) -> Result<Frame> {
        let mut buf = data;

        if buf.remaining() < 3 {
            return Err(ProtocolError::FrameInvalid("truncated header".to_string()));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::FrameInvalid(format!(
                "unsupported version {version}"
            )));
        }
        let type_byte = buf.get_u8();
        let frame_type = FrameType::from_byte(type_byte)
            .ok_or_else(|| ProtocolError::FrameInvalid(format!("unknown type {type_byte}")))?;
        let frame_flags = buf.get_u8();
        if frame_flags & flags::RESERVED != 0 {
            return Err(ProtocolError::FrameInvalid(format!(
                "reserved flag bits set: {frame_flags:#04x}"
            )));
        }

        let namespace = read_short_string(&mut buf, "namespace")?;
        let event = read_short_string(&mut buf, "event")?;

        let ack_id = if frame_flags & flags::ACK_REQUESTED != 0 || frame_type == FrameType::Ack {
            if buf.remaining() < 4 {
                return Err(ProtocolError::FrameInvalid("truncated ack id".to_string()));
            }
            Some(buf.get_u32())
        } else {
            None
        };

        if buf.remaining() < 4 {
            return Err(ProtocolError::FrameInvalid(
                "truncated payload length".to_string(),
            ));
        }
        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                actual: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        if buf.remaining() != payload_len {
            return Err(ProtocolError::FrameInvalid(format!(
                "payload length {payload_len} does not match remaining {} bytes",
                buf.remaining()
            )));
        }
        let mut payload = buf.to_vec();

        if frame_flags & flags::ENCRYPTED != 0 {
            let key = self.config.encryption_key.as_ref().ok_or_else(|| {
                ProtocolError::DecryptFailed("encrypted frame but no key configured".to_string())
            })?;
            payload = crypto::open(key, &payload)?;
        }
        if frame_flags & flags::COMPRESSED != 0 {
            payload = compress::inflate(&payload)?;
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                actual: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let payload = if frame_flags & flags::BINARY != 0 {
            Payload::Binary(payload)
        } else {
            Payload::Json(
                serde_json::from_slice(&payload)
                    .map_err(|e| ProtocolError::PayloadParseFailed(e.to_string()))?,
            )
        };

        Ok(Frame {
            frame_type,
            namespace,
            event,
            ack_id,
            payload,
        })
    }
}

fn read_short_string(buf: &mut &[u8], field: &str) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::FrameInvalid(format!(
            "truncated {field} length"
        )));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::FrameInvalid(format!("truncated {field}")));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| ProtocolError::FrameInvalid(format!("{field} is not utf-8")))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn codec() -> FrameCodec {
        FrameCodec::new(CodecConfig::default())
    }

    #[test]
    fn test_event_roundtrip_plain() {
        let frame = Frame::event("/chat", "say", json!({"text": "hi", "n": 3}));
        let encoded = codec().encode(&frame).unwrap();
        assert_eq!(codec().decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_ack_roundtrip_carries_id() {
        let frame = Frame::ack("/chat", "save", 0xDEAD_BEEF, json!({"ok": true}));
        let encoded = codec().encode(&frame).unwrap();
        let decoded = codec().decode(&encoded).unwrap();
        assert_eq!(decoded.ack_id, Some(0xDEAD_BEEF));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_ack_requested_flag_set_on_wire() {
        let frame = Frame::event_with_ack("/", "save", 7, json!({"k": 1}));
        let encoded = codec().encode(&frame).unwrap();
        assert_ne!(encoded[2] & flags::ACK_REQUESTED, 0);
        assert_eq!(codec().decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_binary_payload_roundtrip() {
        let frame = Frame {
            frame_type: FrameType::Event,
            namespace: "/feed".to_string(),
            event: "blob".to_string(),
            ack_id: None,
            payload: Payload::Binary(vec![0, 1, 2, 0xFF, 0xFE]),
        };
        let encoded = codec().encode(&frame).unwrap();
        assert_ne!(encoded[2] & flags::BINARY, 0);
        assert_eq!(codec().decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let text = "a".repeat(4096);
        let frame = Frame::event("/chat", "say", json!({ "text": text }));
        let encoded = codec().encode(&frame).unwrap();
        assert_ne!(encoded[2] & flags::COMPRESSED, 0);
        // Compressed wire form is smaller than the JSON it carries
        assert!(encoded.len() < 4096);
        assert_eq!(codec().decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let frame = Frame::event("/chat", "say", json!({"text": "hi"}));
        let encoded = codec().encode(&frame).unwrap();
        assert_eq!(encoded[2] & flags::COMPRESSED, 0);
    }

    #[test]
    fn test_compression_and_encryption_roundtrip() {
        // 4 KB payload, 1 KB threshold, encryption on: both flag bits set
        let config = CodecConfig {
            compression_threshold: 1024,
            compression_level: 6,
            encryption_key: Some([7u8; 32]),
        };
        let codec = FrameCodec::new(config);
        let text: String = (0..4096).map(|i| ((i % 26) as u8 + b'a') as char).collect();
        let frame = Frame::event("/chat", "bulk", json!({ "text": text }));

        let encoded = codec.encode(&frame).unwrap();
        assert_ne!(encoded[2] & flags::COMPRESSED, 0);
        assert_ne!(encoded[2] & flags::ENCRYPTED, 0);
        assert_eq!(codec.decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_encryption_only_below_threshold() {
        let codec = FrameCodec::new(CodecConfig {
            encryption_key: Some([7u8; 32]),
            ..CodecConfig::default()
        });
        let frame = Frame::event("/chat", "say", json!({"text": "short"}));
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(encoded[2] & flags::COMPRESSED, 0);
        assert_ne!(encoded[2] & flags::ENCRYPTED, 0);
        assert_eq!(codec.decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_encrypted_frame_without_key_rejected() {
        let sealing = FrameCodec::new(CodecConfig {
            encryption_key: Some([7u8; 32]),
            ..CodecConfig::default()
        });
        let encoded = sealing
            .encode(&Frame::event("/", "x", json!(1)))
            .unwrap();
        let err = codec().decode(&encoded).unwrap_err();
        assert_eq!(err.code(), "decrypt_failed");
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut encoded = codec().encode(&Frame::event("/", "x", json!(1))).unwrap();
        encoded[0] = 2;
        let err = codec().decode(&encoded).unwrap_err();
        assert_eq!(err.code(), "frame_invalid");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut encoded = codec().encode(&Frame::event("/", "x", json!(1))).unwrap();
        encoded[1] = 0x7F;
        assert_eq!(codec().decode(&encoded).unwrap_err().code(), "frame_invalid");
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let mut encoded = codec().encode(&Frame::event("/", "x", json!(1))).unwrap();
        encoded[2] |= 0b0000_0001;
        assert_eq!(codec().decode(&encoded).unwrap_err().code(), "frame_invalid");
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let encoded = codec()
            .encode(&Frame::event("/chat", "say", json!({"text": "hi"})))
            .unwrap();
        for cut in 0..encoded.len() {
            let err = codec().decode(&encoded[..cut]).unwrap_err();
            assert_eq!(err.code(), "frame_invalid", "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = codec().encode(&Frame::event("/", "x", json!(1))).unwrap();
        encoded.push(0);
        assert_eq!(codec().decode(&encoded).unwrap_err().code(), "frame_invalid");
    }

    #[test]
    fn test_non_json_payload_rejected() {
        let frame = Frame::event("/", "x", json!(1));
        let mut encoded = codec().encode(&frame).unwrap();
        let n = encoded.len();
        encoded[n - 1] = b'{';
        assert_eq!(
            codec().decode(&encoded).unwrap_err().code(),
            "payload_parse_failed"
        );
    }

    #[test]
    fn test_declared_payload_over_cap_rejected() {
        let frame = Frame::event("/", "x", json!(1));
        let encoded = codec().encode(&frame).unwrap();
        // Header for "/" + "x": 3 + 2 + 1 + 2 + 1 = 9 bytes, then payload len
        let mut forged = encoded[..9].to_vec();
        forged.extend_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        assert_eq!(
            codec().decode(&forged).unwrap_err().code(),
            "payload_too_large"
        );
    }

    #[test]
    fn test_control_frames_roundtrip() {
        for frame in [
            Frame::connect("/chat", "s1"),
            Frame::disconnect("/chat"),
            Frame::heartbeat("/"),
            Frame::heartbeat_ack("/"),
            Frame::error("/chat", "rate_limited", "slow down", Some("say")),
        ] {
            let encoded = codec().encode(&frame).unwrap();
            assert_eq!(codec().decode(&encoded).unwrap(), frame);
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_flags(
            text in ".{0,2000}",
            event in "[a-z:_-]{1,32}",
            ack in proptest::option::of(any::<u32>()),
            threshold in 16usize..2048,
            encrypt in any::<bool>(),
        ) {
            let codec = FrameCodec::new(CodecConfig {
                compression_threshold: threshold,
                compression_level: 6,
                encryption_key: encrypt.then_some([3u8; 32]),
            });
            let frame = Frame {
                frame_type: FrameType::Event,
                namespace: "/prop".to_string(),
                event,
                ack_id: ack,
                payload: Payload::Json(json!({ "text": text })),
            };
            let encoded = codec.encode(&frame).unwrap();
            prop_assert_eq!(codec.decode(&encoded).unwrap(), frame);
        }
    }
}
