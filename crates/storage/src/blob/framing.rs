//! On-disk frame formats for blob segments and erasure shards.
//!
//! # Segment frame
//!
//! ```text
//! ┌───────────┬─────────────┬──────────────┬───────────────────┬───────────┐
//! │ Magic (4) │ Version (4) │ Length (8)   │ Payload (variable)│ CRC32 (4) │
//! └───────────┴─────────────┴──────────────┴───────────────────┴───────────┘
//! ```
//!
//! # Shard frame
//!
//! The shard header additionally records which segment and shard index the
//! bytes belong to plus the length of the original (pre-split) payload, so a
//! reader can truncate the reassembled buffer without a directory lookup.
//!
//! ```text
//! ┌───────────┬─────────────┬────────────────┬───────────┬──────────────┬─────────────┬─────────┬───────────┐
//! │ Magic (4) │ Version (4) │ SegmentId (16) │ Index (4) │ Original (8) │ Length (8)  │ Payload │ CRC32 (4) │
//! └───────────┴─────────────┴────────────────┴───────────┴──────────────┴─────────────┴─────────┴───────────┘
//! ```
//!
//! The CRC covers the payload only; header corruption already fails the
//! magic/version check. A frame that fails any check decodes to `None` and
//! the caller decides whether that is retryable (`Io`) or terminal
//! (`DataLoss`).

use crc32fast::Hasher;
use sop_core::SegmentId;

/// Magic bytes identifying a blob segment: "SOPB".
pub const SEGMENT_MAGIC: [u8; 4] = *b"SOPB";
/// Magic bytes identifying an erasure shard: "SOPS".
pub const SHARD_MAGIC: [u8; 4] = *b"SOPS";

/// Current frame format version.
pub const FRAME_FORMAT_VERSION: u32 = 1;

/// Segment frame header size.
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// Shard frame header size.
pub const SHARD_HEADER_SIZE: usize = 44;

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Frame a segment payload.
pub fn encode_segment(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEGMENT_HEADER_SIZE + payload.len() + 4);
    out.extend_from_slice(&SEGMENT_MAGIC);
    out.extend_from_slice(&FRAME_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32(payload).to_le_bytes());
    out
}

/// Unframe a segment; `None` on any integrity failure.
pub fn decode_segment(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() < SEGMENT_HEADER_SIZE + 4 {
        return None;
    }
    if bytes[0..4] != SEGMENT_MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    if version != FRAME_FORMAT_VERSION {
        return None;
    }
    let len = u64::from_le_bytes(bytes[8..16].try_into().ok()?) as usize;
    if bytes.len() != SEGMENT_HEADER_SIZE + len + 4 {
        return None;
    }
    let payload = &bytes[SEGMENT_HEADER_SIZE..SEGMENT_HEADER_SIZE + len];
    let stored = u32::from_le_bytes(bytes[SEGMENT_HEADER_SIZE + len..].try_into().ok()?);
    if crc32(payload) != stored {
        return None;
    }
    Some(payload.to_vec())
}

/// Decoded shard header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFrame {
    pub segment_id: SegmentId,
    pub shard_index: u32,
    /// Length of the original payload before shard splitting.
    pub original_len: u64,
    pub payload: Vec<u8>,
}

/// Frame one erasure shard.
pub fn encode_shard(
    segment_id: SegmentId,
    shard_index: u32,
    original_len: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(SHARD_HEADER_SIZE + payload.len() + 4);
    out.extend_from_slice(&SHARD_MAGIC);
    out.extend_from_slice(&FRAME_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(segment_id.as_bytes());
    out.extend_from_slice(&shard_index.to_le_bytes());
    out.extend_from_slice(&original_len.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32(payload).to_le_bytes());
    out
}

/// Unframe a shard; `None` on any integrity failure, including a shard that
/// belongs to a different segment than expected.
pub fn decode_shard(bytes: &[u8], expected_segment: SegmentId) -> Option<ShardFrame> {
    if bytes.len() < SHARD_HEADER_SIZE + 4 {
        return None;
    }
    if bytes[0..4] != SHARD_MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    if version != FRAME_FORMAT_VERSION {
        return None;
    }
    let segment_id = SegmentId::from_bytes(bytes[8..24].try_into().ok()?);
    if segment_id != expected_segment {
        return None;
    }
    let shard_index = u32::from_le_bytes(bytes[24..28].try_into().ok()?);
    let original_len = u64::from_le_bytes(bytes[28..36].try_into().ok()?);
    let len = u64::from_le_bytes(bytes[36..44].try_into().ok()?) as usize;
    if bytes.len() != SHARD_HEADER_SIZE + len + 4 {
        return None;
    }
    let payload = &bytes[SHARD_HEADER_SIZE..SHARD_HEADER_SIZE + len];
    let stored = u32::from_le_bytes(bytes[SHARD_HEADER_SIZE + len..].try_into().ok()?);
    if crc32(payload) != stored {
        return None;
    }
    Some(ShardFrame {
        segment_id,
        shard_index,
        original_len,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trip() {
        let payload = b"hello blob".to_vec();
        let framed = encode_segment(&payload);
        assert_eq!(decode_segment(&framed), Some(payload));
    }

    #[test]
    fn segment_rejects_flipped_bit() {
        let mut framed = encode_segment(b"payload");
        let mid = SEGMENT_HEADER_SIZE + 3;
        framed[mid] ^= 0x40;
        assert_eq!(decode_segment(&framed), None);
    }

    #[test]
    fn segment_rejects_truncation() {
        let framed = encode_segment(b"payload");
        assert_eq!(decode_segment(&framed[..framed.len() - 1]), None);
        assert_eq!(decode_segment(&[]), None);
    }

    #[test]
    fn shard_round_trip() {
        let id = SegmentId::new();
        let framed = encode_shard(id, 2, 999, b"shard bytes");
        let frame = decode_shard(&framed, id).unwrap();
        assert_eq!(frame.shard_index, 2);
        assert_eq!(frame.original_len, 999);
        assert_eq!(frame.payload, b"shard bytes");
    }

    #[test]
    fn shard_rejects_wrong_segment() {
        let framed = encode_shard(SegmentId::new(), 0, 10, b"bytes");
        assert!(decode_shard(&framed, SegmentId::new()).is_none());
    }
}
