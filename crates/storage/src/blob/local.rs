//! Filesystem blob store with an optional passive replica.
//!
//! Segments land under `<folder>/segments/<aa>/<bb>/<uuid>.seg` where `aa`
//! and `bb` fan out on the first two id bytes. Writes go to a temp file in
//! the target directory and are renamed into place after fsync, so a
//! concurrent reader sees either nothing or the whole frame.
//!
//! With a passive folder configured, every write lands in both folders and
//! a write only reports success once both are durable. Reads prefer the
//! active copy and fall back to the passive one on a miss or integrity
//! failure, repairing the active copy best-effort on the way out.

use crate::blob::framing::{decode_segment, encode_segment};
use crate::blob::{fan_out, BlobStore};
use sop_core::{Context, Error, Result, SegmentId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Blob store over one or two local folders.
pub struct FileBlobStore {
    active: PathBuf,
    passive: Option<PathBuf>,
}

impl FileBlobStore {
    pub fn new(active: impl Into<PathBuf>, passive: Option<PathBuf>) -> Self {
        FileBlobStore {
            active: active.into(),
            passive,
        }
    }

    fn segment_path(folder: &Path, segment_id: SegmentId) -> PathBuf {
        let (hi, lo) = fan_out(segment_id);
        folder
            .join("segments")
            .join(hi)
            .join(lo)
            .join(format!("{}.seg", segment_id))
    }

    fn write_to(folder: &Path, segment_id: SegmentId, framed: &[u8]) -> Result<()> {
        let path = Self::segment_path(folder, segment_id);
        let dir = path.parent().expect("segment path always has a parent");
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{}.tmp", segment_id));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(framed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_from(folder: &Path, segment_id: SegmentId) -> Result<Option<Vec<u8>>> {
        let path = Self::segment_path(folder, segment_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode_segment(&bytes) {
            Some(payload) => Ok(Some(payload)),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("segment {} failed integrity check at {:?}", segment_id, path),
            ))),
        }
    }

    fn remove_from(folder: &Path, segment_id: SegmentId) -> Result<()> {
        let path = Self::segment_path(folder, segment_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlobStore for FileBlobStore {
    fn write(&self, ctx: &Context, segment_id: SegmentId, payload: &[u8]) -> Result<()> {
        ctx.check()?;
        let framed = encode_segment(payload);
        Self::write_to(&self.active, segment_id, &framed)?;
        if let Some(passive) = &self.passive {
            Self::write_to(passive, segment_id, &framed)?;
        }
        debug!(segment = %segment_id, bytes = payload.len(), "segment written");
        Ok(())
    }

    fn read(&self, ctx: &Context, segment_id: SegmentId) -> Result<Vec<u8>> {
        ctx.check()?;
        let active_result = Self::read_from(&self.active, segment_id);
        match (&active_result, &self.passive) {
            (Ok(Some(payload)), _) => return Ok(payload.clone()),
            (_, None) => {}
            (_, Some(passive)) => {
                if let Some(payload) = Self::read_from(passive, segment_id)? {
                    warn!(segment = %segment_id, "active copy unusable, served from passive replica");
                    // Repair the active copy so the next read stays local.
                    let framed = encode_segment(&payload);
                    if let Err(e) = Self::write_to(&self.active, segment_id, &framed) {
                        warn!(segment = %segment_id, error = %e, "active repair failed");
                    }
                    return Ok(payload);
                }
            }
        }
        match active_result {
            Ok(Some(_)) => unreachable!("returned above"),
            Ok(None) => Err(Error::not_found(format!("segment {}", segment_id))),
            // Both copies corrupt, or corrupt with no replica configured.
            Err(_) if self.passive.is_some() => Err(Error::data_loss(format!(
                "segment {} failed integrity on both replicas",
                segment_id
            ))),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, ctx: &Context, segment_id: SegmentId) -> Result<()> {
        ctx.check()?;
        Self::remove_from(&self.active, segment_id)?;
        if let Some(passive) = &self.passive {
            Self::remove_from(passive, segment_id)?;
        }
        Ok(())
    }
}
