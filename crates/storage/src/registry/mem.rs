//! In-process registry.
//!
//! One mutex around a plain map: every batch observes and publishes
//! atomically, which makes this the reference implementation for the CAS
//! contract. Unit and integration tests run against it, and a clustered
//! adapter (conditional updates against an external keyspace) must behave
//! identically per batch.

use crate::registry::{Registry, RegistryEntry, RegistryUpdate};
use parking_lot::Mutex;
use sop_core::{Context, Error, LogicalId, Result, SegmentId};
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<LogicalId, (SegmentId, u64)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry::default()
    }

    /// Number of live entries, for tests and teardown assertions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry for MemoryRegistry {
    fn lookup(&self, ctx: &Context, ids: &[LogicalId]) -> Result<Vec<Option<RegistryEntry>>> {
        ctx.check()?;
        let entries = self.entries.lock();
        Ok(ids
            .iter()
            .map(|id| {
                entries.get(id).map(|(segment_id, version)| RegistryEntry {
                    logical_id: *id,
                    segment_id: *segment_id,
                    version: *version,
                })
            })
            .collect())
    }

    fn cas_update(&self, ctx: &Context, updates: &[RegistryUpdate]) -> Result<()> {
        ctx.check()?;
        let mut entries = self.entries.lock();
        // Validate the whole batch before touching anything.
        let offenders: Vec<LogicalId> = updates
            .iter()
            .filter(|u| {
                let current = entries.get(&u.logical_id).map(|(_, v)| *v).unwrap_or(0);
                current != u.expected_version
            })
            .map(|u| u.logical_id)
            .collect();
        if !offenders.is_empty() {
            return Err(Error::conflict(offenders));
        }
        for u in updates {
            entries.insert(u.logical_id, (u.segment_id, u.version));
        }
        Ok(())
    }

    fn remove(&self, ctx: &Context, ids: &[LogicalId]) -> Result<()> {
        ctx.check()?;
        let mut entries = self.entries.lock();
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup() {
        let reg = MemoryRegistry::new();
        let ctx = Context::new();
        let id = LogicalId::new();
        let seg = SegmentId::new();
        reg.cas_update(&ctx, &[RegistryUpdate::insert(id, seg, 1)])
            .unwrap();
        let got = reg.lookup(&ctx, &[id]).unwrap();
        assert_eq!(
            got[0],
            Some(RegistryEntry {
                logical_id: id,
                segment_id: seg,
                version: 1
            })
        );
        assert_eq!(reg.lookup(&ctx, &[LogicalId::new()]).unwrap()[0], None);
    }

    #[test]
    fn stale_expected_version_conflicts_whole_batch() {
        let reg = MemoryRegistry::new();
        let ctx = Context::new();
        let a = LogicalId::new();
        let b = LogicalId::new();
        reg.cas_update(&ctx, &[RegistryUpdate::insert(a, SegmentId::new(), 1)])
            .unwrap();

        let updates = [
            RegistryUpdate::replace(a, 99, SegmentId::new(), 100),
            RegistryUpdate::insert(b, SegmentId::new(), 1),
        ];
        let err = reg.cas_update(&ctx, &updates).unwrap_err();
        assert_eq!(err.offending_ids(), Some(&[a][..]));
        // The valid half of the batch must not have been applied.
        assert_eq!(reg.lookup(&ctx, &[b]).unwrap()[0], None);
    }

    #[test]
    fn insert_conflicts_when_entry_exists() {
        let reg = MemoryRegistry::new();
        let ctx = Context::new();
        let id = LogicalId::new();
        reg.cas_update(&ctx, &[RegistryUpdate::insert(id, SegmentId::new(), 1)])
            .unwrap();
        assert!(reg
            .cas_update(&ctx, &[RegistryUpdate::insert(id, SegmentId::new(), 1)])
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = MemoryRegistry::new();
        let ctx = Context::new();
        let id = LogicalId::new();
        reg.cas_update(&ctx, &[RegistryUpdate::insert(id, SegmentId::new(), 1)])
            .unwrap();
        reg.remove(&ctx, &[id]).unwrap();
        reg.remove(&ctx, &[id]).unwrap();
        assert!(reg.is_empty());
    }
}
