//! Registry: the authoritative mapping from logical node id to physical
//! segment id plus version.
//!
//! A successful `cas_update` is the linearization point of a commit: all
//! entries in one call publish together or not at all, and updates touching
//! overlapping id sets are totally ordered. For a given logical id the
//! `(segment_id, version)` tuple only ever advances.

pub mod file;
pub mod mem;

use sop_core::{Context, LogicalId, Result, SegmentId};

/// One resolved registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub logical_id: LogicalId,
    pub segment_id: SegmentId,
    pub version: u64,
}

/// One conditional mutation inside a `cas_update` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryUpdate {
    pub logical_id: LogicalId,
    /// Version the entry must currently have; 0 means the entry must not
    /// exist yet.
    pub expected_version: u64,
    pub segment_id: SegmentId,
    pub version: u64,
}

impl RegistryUpdate {
    /// Publish a brand-new entry.
    pub fn insert(logical_id: LogicalId, segment_id: SegmentId, version: u64) -> Self {
        RegistryUpdate {
            logical_id,
            expected_version: 0,
            segment_id,
            version,
        }
    }

    /// Replace an existing entry, guarding on the version it had when read.
    pub fn replace(
        logical_id: LogicalId,
        expected_version: u64,
        segment_id: SegmentId,
        version: u64,
    ) -> Self {
        RegistryUpdate {
            logical_id,
            expected_version,
            segment_id,
            version,
        }
    }
}

/// Authoritative logical-to-physical mapping.
///
/// Implementations must make `cas_update` atomic across its whole batch and
/// totally ordered against concurrent calls with overlapping ids.
pub trait Registry: Send + Sync {
    /// Resolve ids to their current entries; absent ids yield `None`.
    fn lookup(&self, ctx: &Context, ids: &[LogicalId]) -> Result<Vec<Option<RegistryEntry>>>;

    /// Apply every update or none. A version mismatch fails the whole batch
    /// with `ConflictRetryable` carrying the offending ids.
    fn cas_update(&self, ctx: &Context, updates: &[RegistryUpdate]) -> Result<()>;

    /// Drop entries outright (store teardown). Absent ids are ignored.
    fn remove(&self, ctx: &Context, ids: &[LogicalId]) -> Result<()>;
}
