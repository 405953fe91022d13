//! Commit sidecar logs for crash-leftover reclamation.
//!
//! With transaction logging on, the commit path writes one JSON log file
//! listing every segment the commit intends to create, before any of them
//! is written, and deletes it once the caches are settled. A log that
//! survives a crash is examined at database open:
//!
//! - If any logged node entry is published (the registry's current segment
//!   for that logical id equals the logged one), the transaction committed;
//!   its segments are live and only the log is removed.
//! - Otherwise the transaction never published; every logged segment is an
//!   orphan and is deleted.
//!
//! Value segments carry no registry entry of their own, which is why the
//! committed/uncommitted decision keys off the node entries written in the
//! same transaction.

use serde::{Deserialize, Serialize};
use sop_core::{Context, LogicalId, Result, SegmentId, TransactionId};
use sop_storage::{BlobStore, Registry};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const LOG_DIR: &str = "txlogs";

/// One intended segment write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLogEntry {
    /// Which store's blob backend holds the segment.
    pub store_name: String,
    /// Set for node and store-info segments; `None` for value blobs.
    pub logical_id: Option<LogicalId>,
    pub segment_id: SegmentId,
}

/// The persisted log record for one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitLogRecord {
    pub tx_id: TransactionId,
    pub created_unix_ms: u64,
    pub entries: Vec<CommitLogEntry>,
}

fn log_path(base: &Path, tx_id: TransactionId) -> PathBuf {
    base.join(LOG_DIR).join(format!("{}.json", tx_id))
}

/// Write the log durably before the first deferred segment write.
pub fn write(base: &Path, tx_id: TransactionId, entries: Vec<CommitLogEntry>) -> Result<()> {
    let record = CommitLogRecord {
        tx_id,
        created_unix_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        entries,
    };
    let dir = base.join(LOG_DIR);
    fs::create_dir_all(&dir)?;
    let tmp = dir.join(format!("{}.tmp", tx_id));
    fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
    fs::rename(&tmp, log_path(base, tx_id))?;
    Ok(())
}

/// Remove the log after a settled commit or an undone failure.
pub fn delete(base: &Path, tx_id: TransactionId) -> Result<()> {
    match fs::remove_file(log_path(base, tx_id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Scan surviving logs older than `min_age` and reclaim orphans.
/// `resolve_blobs` maps a store name to the blob backend its segments live
/// in. Returns the number of logs settled.
pub fn sweep(
    ctx: &Context,
    base: &Path,
    registry: &dyn Registry,
    resolve_blobs: &dyn Fn(&str) -> Arc<dyn BlobStore>,
    min_age: Duration,
) -> Result<usize> {
    let dir = base.join(LOG_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let mut settled = 0;
    for dir_entry in entries {
        ctx.check()?;
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let record: CommitLogRecord = match fs::read(&path).ok().and_then(|bytes| {
            serde_json::from_slice(&bytes).ok()
        }) {
            Some(record) => record,
            None => {
                warn!(?path, "unreadable commit log skipped");
                continue;
            }
        };
        if now_ms.saturating_sub(record.created_unix_ms) < min_age.as_millis() as u64 {
            // Possibly a live commit in another process.
            continue;
        }
        settle(ctx, registry, resolve_blobs, &record)?;
        if let Err(e) = fs::remove_file(&path) {
            warn!(?path, error = %e, "settled commit log could not be removed");
        }
        settled += 1;
    }
    Ok(settled)
}

fn settle(
    ctx: &Context,
    registry: &dyn Registry,
    resolve_blobs: &dyn Fn(&str) -> Arc<dyn BlobStore>,
    record: &CommitLogRecord,
) -> Result<()> {
    let node_entries: Vec<&CommitLogEntry> = record
        .entries
        .iter()
        .filter(|e| e.logical_id.is_some())
        .collect();
    let ids: Vec<LogicalId> = node_entries.iter().filter_map(|e| e.logical_id).collect();
    let current = registry.lookup(ctx, &ids)?;
    let committed = node_entries.iter().zip(&current).any(|(entry, found)| {
        found
            .as_ref()
            .map(|f| f.segment_id == entry.segment_id)
            .unwrap_or(false)
    });
    if committed {
        debug!(tx = %record.tx_id, "commit log names a published transaction; segments kept");
        return Ok(());
    }
    for entry in &record.entries {
        let blobs = resolve_blobs(&entry.store_name);
        if let Err(e) = blobs.remove(ctx, entry.segment_id) {
            warn!(tx = %record.tx_id, segment = %entry.segment_id, error = %e,
                  "orphan segment could not be deleted");
        }
    }
    debug!(tx = %record.tx_id, orphans = record.entries.len(), "crash leftovers reclaimed");
    Ok(())
}
