//! Bounded DEFLATE (RFC 1951) payload compression

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::ProtocolError;
use crate::frame::MAX_PAYLOAD_LEN;
use crate::Result;

/// Upper bound on the inflate expansion ratio. Input that inflates past
/// `compressed_len * MAX_INFLATE_RATIO` is rejected (zip-bomb guard).
/// DEFLATE tops out near 1032:1, so honest payloads sit far below this.
pub const MAX_INFLATE_RATIO: usize = 512;

/// Compress `data` at the given DEFLATE level (clamped to 1..=9).
pub fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level.clamp(1, 9)),
    );
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::CompressFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::CompressFailed(e.to_string()))
}

/// Inflate `data`, bounded by both the payload cap and the expansion ratio.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let cap = MAX_PAYLOAD_LEN.min(data.len().saturating_mul(MAX_INFLATE_RATIO));
    let mut out = Vec::new();
    let mut decoder = DeflateDecoder::new(data).take(cap as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::DecompressFailed(e.to_string()))?;
    if out.len() > cap {
        return Err(ProtocolError::DecompressFailed(format!(
            "inflated past the {cap} byte bound"
        )));
    }
    Ok(out)
}
