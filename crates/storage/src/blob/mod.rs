//! Blob store: append/read/delete of opaque, immutable byte segments.
//!
//! Segments are content holders only; naming and versioning live in the
//! registry. Writes are idempotent per segment id, and a reader never
//! observes a partially written segment (temp file + rename on the local
//! store, all-shards-durable on the erasure store).

pub mod erasure;
pub mod framing;
pub mod local;

use sop_core::{Context, Result, SegmentId};

/// Storage for immutable blob segments.
pub trait BlobStore: Send + Sync {
    /// Durably write `payload` under `segment_id`. Rewriting an existing
    /// segment with identical bytes is a no-op.
    fn write(&self, ctx: &Context, segment_id: SegmentId, payload: &[u8]) -> Result<()>;

    /// Read a segment back. `NotFound` when the segment was never written
    /// or already deleted; `DataLoss` when it exists but cannot be
    /// reconstructed intact.
    fn read(&self, ctx: &Context, segment_id: SegmentId) -> Result<Vec<u8>>;

    /// Delete a segment. Deleting an absent segment is a no-op.
    fn remove(&self, ctx: &Context, segment_id: SegmentId) -> Result<()>;
}

/// Two-level fan-out directory for a segment id, shared by the local and
/// erasure stores so drives stay balanced and directories stay small.
pub(crate) fn fan_out(segment_id: SegmentId) -> (String, String) {
    let bytes = segment_id.as_bytes();
    (format!("{:02x}", bytes[0]), format!("{:02x}", bytes[1]))
}
