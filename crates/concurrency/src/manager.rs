//! Commit orchestration.
//!
//! The commit runs in phases, each tagging its failures with the phase and
//! transaction id:
//!
//! 1. **Freeze** — the write plan is fixed: every dirty node and deferred
//!    value gets its target segment id, and the commit sidecar log is
//!    written when logging is on. Actively persisted values are already on
//!    disk by now.
//! 2. **Lock** — lease locks on the store roots and every written node id,
//!    taken in sorted order with jittered retry.
//! 3. **Validate** — re-read registry versions for the read set; any
//!    divergence aborts with `ConflictRetryable` (skipped in no-check
//!    mode).
//! 4. **WriteBlobs** — persist staged node and value segments, with bounded
//!    retry on environmental failures.
//! 5. **Publish** — one multi-entry registry CAS covering every store; this
//!    is the linearization point. Entries for nodes deleted by merges are
//!    removed right after.
//! 6. **Finalize** — refresh/invalidate caches, queue replaced segments for
//!    retention reclamation, drop the sidecar log, release locks.
//!
//! Any failure after WriteBlobs begins deletes the just-written segments
//! best-effort; leftovers are covered by the sidecar log sweep at the next
//! database open.

use crate::commit_log::{self, CommitLogEntry};
use crate::retry::with_io_retries;
use crate::transaction::{store_info_logical_id, Transaction, TxState};
use sop_core::{CommitPhase, Context, Error, LogicalId, Result, SegmentId, TransactionMode};
use sop_storage::{
    CacheClass, CachedValue, LockManager, RegistryUpdate, RetryPolicy,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Lease on commit locks; renewed between blob writes and publish.
const LOCK_LEASE: Duration = Duration::from_secs(30);

struct NodeWrite {
    logical_id: LogicalId,
    segment_id: SegmentId,
    expected_version: u64,
    bytes: Vec<u8>,
    /// Segment the previous version lived in, reclaimed after publish.
    replaced_segment: Option<SegmentId>,
}

struct StorePlan {
    slot: usize,
    store_name: String,
    node_writes: Vec<NodeWrite>,
    value_writes: Vec<(SegmentId, Vec<u8>)>,
    /// `(logical id, new segment, expected version, record bytes)`.
    info_write: Option<(LogicalId, SegmentId, u64, Vec<u8>)>,
    /// Deleted node entries with the segment they pointed at.
    deletes: Vec<(LogicalId, Option<SegmentId>)>,
    deleted_values: Vec<SegmentId>,
}

impl Transaction {
    /// Run the two-phase commit. On success the transaction is `Committed`;
    /// on any failure it is `Aborted` and staged work is undone as far as
    /// possible.
    pub fn commit(&mut self, ctx: &Context) -> Result<()> {
        if matches!(self.state(), TxState::Committed | TxState::Aborted) {
            return Err(Error::invalid_state(format!(
                "transaction {} is already {:?}",
                self.id(),
                self.state()
            )));
        }
        self.ensure_active()?;
        ctx.check()?;
        self.set_state(TxState::Committing);
        match self.run_commit(ctx) {
            Ok(()) => {
                self.set_state(TxState::Committed);
                debug!(tx = %self.id(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                self.set_state(TxState::Aborted);
                Err(e)
            }
        }
    }

    fn run_commit(&mut self, ctx: &Context) -> Result<()> {
        let tx_id = self.id();
        if !self.stores.iter().any(|s| s.has_writes()) {
            // Read-only commit: the snapshot must still hold for modes that
            // promise consistency.
            if self.mode() != TransactionMode::NoCheck {
                return self
                    .validate(ctx)
                    .map_err(|e| e.in_commit_phase(tx_id, CommitPhase::Validate));
            }
            return Ok(());
        }

        // P1: freeze the plan and log intent.
        let plan = self
            .build_plan()
            .map_err(|e| e.in_commit_phase(tx_id, CommitPhase::Freeze))?;
        if self.logging() {
            if let Some(dir) = self.log_dir.clone() {
                commit_log::write(&dir, tx_id, log_entries(&plan))
                    .map_err(|e| e.in_commit_phase(tx_id, CommitPhase::Freeze))?;
            }
        }

        // P2: lock the write set in global order.
        let lock_manager = LockManager::new(
            self.lock_backend.clone(),
            tx_id.to_string(),
            LOCK_LEASE,
            RetryPolicy::default(),
        );
        let locks = lock_manager
            .acquire_all(ctx, &lock_keys(self, &plan))
            .map_err(|e| e.in_commit_phase(tx_id, CommitPhase::Lock))?;

        // P3: optimistic validation.
        if self.mode() == TransactionMode::ForWriting {
            if let Err(e) = self.validate(ctx) {
                self.undo_log(tx_id);
                return Err(e.in_commit_phase(tx_id, CommitPhase::Validate));
            }
        }

        // P4: write every new segment.
        let mut written: Vec<(usize, SegmentId)> = Vec::new();
        if let Err(e) = self.write_segments(ctx, &plan, &mut written) {
            self.undo_segments(ctx, &written);
            self.undo_log(tx_id);
            return Err(e.in_commit_phase(tx_id, CommitPhase::WriteBlobs));
        }

        // The lease must outlive publish; a lost lease means another owner
        // may already be inside our write set.
        if let Err(e) = lock_manager.renew(&locks) {
            self.undo_segments(ctx, &written);
            self.undo_log(tx_id);
            return Err(e.in_commit_phase(tx_id, CommitPhase::Lock));
        }

        // P5: the linearization point.
        let updates = match self.build_updates(ctx, &plan) {
            Ok(updates) => updates,
            Err(e) => {
                self.undo_segments(ctx, &written);
                self.undo_log(tx_id);
                return Err(e.in_commit_phase(tx_id, CommitPhase::Publish));
            }
        };
        if let Err(e) = self.registry.cas_update(ctx, &updates) {
            self.undo_segments(ctx, &written);
            self.undo_log(tx_id);
            return Err(e.in_commit_phase(tx_id, CommitPhase::Publish));
        }
        let delete_ids: Vec<LogicalId> = plan
            .iter()
            .flat_map(|p| p.deletes.iter().map(|(id, _)| *id))
            .collect();
        let removal_ok = if delete_ids.is_empty() {
            true
        } else {
            match self.registry.remove(ctx, &delete_ids) {
                Ok(()) => true,
                Err(e) => {
                    // Published state is correct; stale delete entries just
                    // pin their segments until an operator sweep.
                    warn!(tx = %tx_id, error = %e, "registry removal of merged nodes failed");
                    false
                }
            }
        };

        // P6: settle caches, queue reclamation, drop the log, unlock.
        self.finalize(&plan, removal_ok);
        self.undo_log(tx_id);
        locks.release();
        Ok(())
    }

    /// Fix target segments and record bytes for everything this commit
    /// writes.
    fn build_plan(&mut self) -> Result<Vec<StorePlan>> {
        let mut plans = Vec::new();
        for slot in 0..self.stores.len() {
            let store = &self.stores[slot];
            if !store.has_writes() {
                continue;
            }
            let mut node_writes = Vec::with_capacity(store.dirty_nodes.len());
            for id in &store.dirty_nodes {
                let node = store
                    .staged_nodes
                    .get(id)
                    .ok_or_else(|| Error::internal(format!("dirty node {} not staged", id)))?;
                let resolved = store.resolved.get(id);
                node_writes.push(NodeWrite {
                    logical_id: *id,
                    segment_id: SegmentId::new(),
                    expected_version: resolved.map(|e| e.version).unwrap_or(0),
                    bytes: node.encode()?,
                    replaced_segment: resolved.map(|e| e.segment_id),
                });
            }
            // Deterministic write/update order keeps conflict reports and
            // tests stable.
            node_writes.sort_by_key(|w| w.logical_id);

            let info_write = if store.info_dirty {
                let mut info = store.info.clone();
                info.version = store.info_version + 1;
                let logical = store_info_logical_id(info.store_uuid);
                let bytes = serde_json::to_vec_pretty(&info)?;
                Some((logical, SegmentId::new(), store.info_version, bytes))
            } else {
                None
            };

            let deletes = store
                .deleted_nodes
                .iter()
                .map(|id| (*id, store.resolved.get(id).map(|e| e.segment_id)))
                .collect();

            plans.push(StorePlan {
                slot,
                store_name: store.info.store_name.clone(),
                node_writes,
                value_writes: store
                    .staged_values
                    .iter()
                    .map(|(segment, bytes)| (*segment, bytes.clone()))
                    .collect(),
                info_write,
                deletes,
                deleted_values: {
                    let mut values = store.deleted_values.clone();
                    if let Some(entry) = store
                        .resolved
                        .get(&store_info_logical_id(store.info.store_uuid))
                    {
                        if store.info_dirty {
                            values.push(entry.segment_id);
                        }
                    }
                    values
                },
            });
        }
        Ok(plans)
    }

    /// Fresh registry read of every read-set entry; divergence is a
    /// conflict naming the offending ids.
    fn validate(&mut self, ctx: &Context) -> Result<()> {
        let mut expected: HashMap<LogicalId, u64> = HashMap::new();
        for store in &self.stores {
            for (id, version) in &store.read_set {
                expected.insert(*id, *version);
            }
        }
        if expected.is_empty() {
            return Ok(());
        }
        let ids: Vec<LogicalId> = expected.keys().copied().collect();
        let current = self.registry.lookup(ctx, &ids)?;
        let mut offenders: Vec<LogicalId> = ids
            .iter()
            .zip(&current)
            .filter(|(id, found)| {
                let now = found.as_ref().map(|f| f.version).unwrap_or(0);
                now != expected[*id]
            })
            .map(|(id, _)| *id)
            .collect();
        if offenders.is_empty() {
            Ok(())
        } else {
            offenders.sort();
            Err(Error::conflict(offenders))
        }
    }

    fn write_segments(
        &mut self,
        ctx: &Context,
        plan: &[StorePlan],
        written: &mut Vec<(usize, SegmentId)>,
    ) -> Result<()> {
        let policy = RetryPolicy::default();
        for store_plan in plan {
            let blobs = self.stores[store_plan.slot].blobs.clone();
            for (segment, bytes) in &store_plan.value_writes {
                with_io_retries(ctx, &policy, || blobs.write(ctx, *segment, bytes))?;
                written.push((store_plan.slot, *segment));
            }
            for write in &store_plan.node_writes {
                with_io_retries(ctx, &policy, || {
                    blobs.write(ctx, write.segment_id, &write.bytes)
                })?;
                written.push((store_plan.slot, write.segment_id));
            }
            if let Some((_, segment, _, bytes)) = &store_plan.info_write {
                with_io_retries(ctx, &policy, || blobs.write(ctx, *segment, bytes))?;
                written.push((store_plan.slot, *segment));
            }
        }
        Ok(())
    }

    fn build_updates(&mut self, ctx: &Context, plan: &[StorePlan]) -> Result<Vec<RegistryUpdate>> {
        let mut updates = Vec::new();
        for store_plan in plan {
            for write in &store_plan.node_writes {
                updates.push(RegistryUpdate::replace(
                    write.logical_id,
                    write.expected_version,
                    write.segment_id,
                    write.expected_version + 1,
                ));
            }
            if let Some((logical, segment, expected, _)) = &store_plan.info_write {
                updates.push(RegistryUpdate::replace(
                    *logical, *expected, *segment, *expected + 1,
                ));
            }
        }
        if self.mode() == TransactionMode::NoCheck {
            // Fire-and-forget: overwrite whatever is current instead of
            // insisting on the snapshot.
            let ids: Vec<LogicalId> = updates.iter().map(|u| u.logical_id).collect();
            let current = self.registry.lookup(ctx, &ids)?;
            for (update, found) in updates.iter_mut().zip(&current) {
                let now = found.as_ref().map(|f| f.version).unwrap_or(0);
                update.expected_version = now;
                update.version = now + 1;
            }
        }
        Ok(updates)
    }

    fn undo_segments(&mut self, ctx: &Context, written: &[(usize, SegmentId)]) {
        for (slot, segment) in written {
            let blobs = self.stores[*slot].blobs.clone();
            if let Err(e) = blobs.remove(ctx, *segment) {
                warn!(tx = %self.id(), segment = %segment, error = %e,
                      "commit undo could not delete segment");
            }
        }
    }

    fn undo_log(&mut self, tx_id: sop_core::TransactionId) {
        if !self.logging() {
            return;
        }
        if let Some(dir) = &self.log_dir {
            if let Err(e) = commit_log::delete(dir, tx_id) {
                warn!(tx = %tx_id, error = %e, "commit log cleanup failed");
            }
        }
    }

    fn finalize(&mut self, plan: &[StorePlan], removal_ok: bool) {
        for store_plan in plan {
            let store = &self.stores[store_plan.slot];
            let config = &store.info.cache_config;
            let node_ttl = config.node_ttl();
            let node_sliding = config.is_node_cache_ttl;

            for write in &store_plan.node_writes {
                let key = write.logical_id.to_string();
                let new_version = write.expected_version + 1;
                let _ = self.cache.put(
                    CacheClass::Node,
                    &key,
                    CachedValue::new(new_version, write.bytes.clone()),
                    node_ttl,
                    node_sliding,
                    true,
                );
                let entry = sop_storage::RegistryEntry {
                    logical_id: write.logical_id,
                    segment_id: write.segment_id,
                    version: new_version,
                };
                let _ = self.cache.put(
                    CacheClass::RegistryEntry,
                    &key,
                    CachedValue::new(new_version, crate::transaction::encode_registry_entry(&entry)),
                    config.registry_ttl(),
                    config.is_registry_cache_ttl,
                    true,
                );
            }
            for (id, _) in &store_plan.deletes {
                let key = id.to_string();
                let _ = self.cache.invalidate(CacheClass::Node, &key);
                let _ = self.cache.invalidate(CacheClass::RegistryEntry, &key);
            }
            if let Some((logical, segment, expected, bytes)) = &store_plan.info_write {
                let key = store.info.store_uuid.to_string();
                let new_version = expected + 1;
                let _ = self.cache.put(
                    CacheClass::StoreInfo,
                    &key,
                    CachedValue::new(new_version, bytes.clone()),
                    config.store_info_ttl(),
                    config.is_store_info_cache_ttl,
                    true,
                );
                let entry = sop_storage::RegistryEntry {
                    logical_id: *logical,
                    segment_id: *segment,
                    version: new_version,
                };
                let _ = self.cache.put(
                    CacheClass::RegistryEntry,
                    &logical.to_string(),
                    CachedValue::new(new_version, crate::transaction::encode_registry_entry(&entry)),
                    config.registry_ttl(),
                    config.is_registry_cache_ttl,
                    true,
                );
            }
            if store.info.value_placement == sop_core::ValuePlacement::SeparateCached {
                for (segment, bytes) in &store_plan.value_writes {
                    let _ = self.cache.put(
                        CacheClass::ValueBlob,
                        &segment.to_string(),
                        CachedValue::new(1, bytes.clone()),
                        config.value_data_ttl(),
                        config.is_value_data_cache_ttl,
                        true,
                    );
                }
            }

            // Retention queue: replaced node segments always; segments of
            // deleted entries only when their registry rows are gone.
            let mut obsolete: Vec<SegmentId> = store_plan
                .node_writes
                .iter()
                .filter_map(|w| w.replaced_segment)
                .collect();
            obsolete.extend(store_plan.deleted_values.iter().copied());
            if removal_ok {
                obsolete.extend(store_plan.deletes.iter().filter_map(|(_, s)| *s));
            }
            self.reclaim.schedule(store.blobs.clone(), obsolete);
        }
    }
}

fn lock_keys(tx: &Transaction, plan: &[StorePlan]) -> Vec<String> {
    let mut keys = Vec::new();
    for store_plan in plan {
        keys.push(format!(
            "store:{}",
            tx.stores[store_plan.slot].info.store_uuid
        ));
        for write in &store_plan.node_writes {
            keys.push(format!("node:{}", write.logical_id));
        }
        for (id, _) in &store_plan.deletes {
            keys.push(format!("node:{}", id));
        }
    }
    keys
}

fn log_entries(plan: &[StorePlan]) -> Vec<CommitLogEntry> {
    let mut entries = Vec::new();
    for store_plan in plan {
        for write in &store_plan.node_writes {
            entries.push(CommitLogEntry {
                store_name: store_plan.store_name.clone(),
                logical_id: Some(write.logical_id),
                segment_id: write.segment_id,
            });
        }
        for (segment, _) in &store_plan.value_writes {
            entries.push(CommitLogEntry {
                store_name: store_plan.store_name.clone(),
                logical_id: None,
                segment_id: *segment,
            });
        }
        if let Some((logical, segment, _, _)) = &store_plan.info_write {
            entries.push(CommitLogEntry {
                store_name: store_plan.store_name.clone(),
                logical_id: Some(*logical),
                segment_id: *segment,
            });
        }
    }
    entries
}
