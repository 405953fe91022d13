//! Retention-based reclamation of obsolete blob segments.
//!
//! A commit that rewrites a node leaves the previous segment on disk; an
//! optimistic reader may still be walking the old tree. Replaced segments
//! are queued here with a timestamp and the blob backend that owns them,
//! and deleted only after the retention window passes, by which point any
//! transaction that could reference them has either validated (and failed)
//! or finished.

use crate::blob::BlobStore;
use parking_lot::Mutex;
use sop_core::{Context, Result, SegmentId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default retention: comfortably longer than the default transaction
/// deadline's lock-retry tail.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

struct Pending {
    queued_at: Instant,
    segment: SegmentId,
    blobs: Arc<dyn BlobStore>,
}

pub struct ReclamationQueue {
    retention: Duration,
    pending: Mutex<VecDeque<Pending>>,
}

impl ReclamationQueue {
    pub fn new(retention: Duration) -> Self {
        ReclamationQueue {
            retention,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue segments that just became unreachable, remembering which
    /// backend holds them.
    pub fn schedule(
        &self,
        blobs: Arc<dyn BlobStore>,
        segments: impl IntoIterator<Item = SegmentId>,
    ) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        for segment in segments {
            pending.push_back(Pending {
                queued_at: now,
                segment,
                blobs: Arc::clone(&blobs),
            });
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delete every segment whose retention has expired. Deletion failures
    /// are re-queued; a segment already gone counts as reclaimed.
    pub fn sweep(&self, ctx: &Context) -> Result<usize> {
        let cutoff = Instant::now() - self.retention;
        self.sweep_older_than(ctx, cutoff)
    }

    /// Test and shutdown hook: reclaim everything queued, regardless of age.
    pub fn reclaim_now(&self, ctx: &Context) -> Result<usize> {
        self.sweep_older_than(ctx, Instant::now())
    }

    fn sweep_older_than(&self, ctx: &Context, cutoff: Instant) -> Result<usize> {
        let due: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let mut due = Vec::new();
            while let Some(front) = pending.front() {
                if front.queued_at > cutoff {
                    break;
                }
                due.push(pending.pop_front().unwrap());
            }
            due
        };

        let mut reclaimed = 0;
        for entry in due {
            ctx.check()?;
            match entry.blobs.remove(ctx, entry.segment) {
                Ok(()) => reclaimed += 1,
                Err(e) => {
                    warn!(segment = %entry.segment, error = %e, "reclaim failed, requeued");
                    self.pending.lock().push_back(Pending {
                        queued_at: Instant::now(),
                        segment: entry.segment,
                        blobs: entry.blobs,
                    });
                }
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "obsolete segments reclaimed");
        }
        Ok(reclaimed)
    }
}
