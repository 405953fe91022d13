//! Reed–Solomon erasure-coded blob store.
//!
//! A payload is split into `k` equal data shards (zero-padded) and extended
//! with `m` parity shards; shard `i` lands on drive path `i`. Any `k` intact
//! shards reconstruct the payload exactly. Shards carry their own frame
//! (segment id, shard index, original length, crc32) so a swapped or
//! truncated shard file is detected and simply treated as missing.
//!
//! A write reports success only after every one of the `k + m` shard files
//! is durable; a partial write surfaces as `Io` and the commit path retries
//! or rolls back. With `repair_corrupted_shards` set, a read that had to
//! reconstruct rewrites the bad shards in place.

use crate::blob::framing::{decode_shard, encode_shard};
use crate::blob::{fan_out, BlobStore};
use reed_solomon_erasure::galois_8::ReedSolomon;
use sop_core::{Context, Error, ErasureCodingConfig, Result, SegmentId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Blob store spreading every segment across `k + m` drive paths.
pub struct ErasureBlobStore {
    config: ErasureCodingConfig,
    codec: ReedSolomon,
}

impl ErasureBlobStore {
    pub fn new(config: ErasureCodingConfig) -> Result<Self> {
        config.validate()?;
        let codec = ReedSolomon::new(config.data_shards_count, config.parity_shards_count)
            .map_err(|e| Error::invalid_config(format!("erasure parameters rejected: {:?}", e)))?;
        Ok(ErasureBlobStore { config, codec })
    }

    pub fn config(&self) -> &ErasureCodingConfig {
        &self.config
    }

    fn shard_path(&self, drive: &Path, segment_id: SegmentId, shard_index: usize) -> PathBuf {
        let (hi, lo) = fan_out(segment_id);
        drive
            .join("shards")
            .join(hi)
            .join(lo)
            .join(format!("{}.s{}", segment_id, shard_index))
    }

    fn write_shard(&self, drive: &Path, segment_id: SegmentId, shard_index: usize, framed: &[u8]) -> Result<()> {
        let path = self.shard_path(drive, segment_id, shard_index);
        let dir = path.parent().expect("shard path always has a parent");
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{}.s{}.tmp", segment_id, shard_index));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(framed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Split `payload` into framed shards. Data shards are zero-padded to a
    /// common length; parity is computed over the padded bytes.
    fn make_shards(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let k = self.config.data_shards_count;
        // Never zero, so parity math stays well-defined for empty payloads.
        let shard_len = (payload.len() / k + 1).max(1);
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.config.total_shards());
        for i in 0..k {
            let start = (i * shard_len).min(payload.len());
            let end = ((i + 1) * shard_len).min(payload.len());
            let mut shard = payload[start..end].to_vec();
            shard.resize(shard_len, 0);
            shards.push(shard);
        }
        for _ in 0..self.config.parity_shards_count {
            shards.push(vec![0u8; shard_len]);
        }
        self.codec
            .encode(&mut shards)
            .map_err(|e| Error::internal(format!("parity encoding failed: {:?}", e)))?;
        Ok(shards)
    }

    /// Gather shard payloads from disk; unreadable or invalid shards come
    /// back as `None`.
    fn gather(&self, segment_id: SegmentId) -> (Vec<Option<Vec<u8>>>, Option<u64>, usize) {
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.config.total_shards()];
        let mut original_len = None;
        let mut present_files = 0;
        for (i, drive) in self
            .config
            .base_folder_paths_across_drives
            .iter()
            .enumerate()
        {
            let path = self.shard_path(drive, segment_id, i);
            let bytes = match fs::read(&path) {
                Ok(bytes) => {
                    present_files += 1;
                    bytes
                }
                Err(_) => continue,
            };
            match decode_shard(&bytes, segment_id) {
                Some(frame) if frame.shard_index as usize == i => {
                    original_len.get_or_insert(frame.original_len);
                    shards[i] = Some(frame.payload);
                }
                _ => {
                    warn!(segment = %segment_id, shard = i, "shard failed integrity check");
                }
            }
        }
        (shards, original_len, present_files)
    }
}

impl BlobStore for ErasureBlobStore {
    fn write(&self, ctx: &Context, segment_id: SegmentId, payload: &[u8]) -> Result<()> {
        ctx.check()?;
        let shards = self.make_shards(payload)?;
        for (i, (drive, shard)) in self
            .config
            .base_folder_paths_across_drives
            .iter()
            .zip(shards.iter())
            .enumerate()
        {
            let framed = encode_shard(segment_id, i as u32, payload.len() as u64, shard);
            self.write_shard(drive, segment_id, i, &framed)?;
        }
        debug!(segment = %segment_id, bytes = payload.len(),
               shards = self.config.total_shards(), "segment sharded and written");
        Ok(())
    }

    fn read(&self, ctx: &Context, segment_id: SegmentId) -> Result<Vec<u8>> {
        ctx.check()?;
        let k = self.config.data_shards_count;
        let (mut shards, original_len, present_files) = self.gather(segment_id);
        let valid = shards.iter().filter(|s| s.is_some()).count();

        if present_files == 0 {
            return Err(Error::not_found(format!("segment {}", segment_id)));
        }
        if valid < k {
            return Err(Error::data_loss(format!(
                "segment {}: only {} of {} shards intact, {} required",
                segment_id, valid, self.config.total_shards(), k
            )));
        }
        let original_len = original_len
            .ok_or_else(|| Error::internal("valid shard without original length"))?
            as usize;

        let needs_reconstruction = shards.iter().take(k).any(|s| s.is_none());
        let needs_repair = shards.iter().any(|s| s.is_none());
        if needs_reconstruction || (needs_repair && self.config.repair_corrupted_shards) {
            self.codec.reconstruct(&mut shards).map_err(|e| {
                Error::data_loss(format!("segment {} reconstruction failed: {:?}", segment_id, e))
            })?;
        }

        let mut payload = Vec::with_capacity(original_len);
        for shard in shards.iter().take(k) {
            let shard = shard
                .as_ref()
                .ok_or_else(|| Error::internal("data shard missing after reconstruction"))?;
            payload.extend_from_slice(shard);
        }
        payload.truncate(original_len);

        if needs_repair && self.config.repair_corrupted_shards {
            self.repair(segment_id, original_len as u64, &shards);
        }
        Ok(payload)
    }

    fn remove(&self, ctx: &Context, segment_id: SegmentId) -> Result<()> {
        ctx.check()?;
        for (i, drive) in self
            .config
            .base_folder_paths_across_drives
            .iter()
            .enumerate()
        {
            let path = self.shard_path(drive, segment_id, i);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl ErasureBlobStore {
    /// Rewrite every shard that was missing or invalid on the last read.
    /// Best-effort: repair failure only warns, the read already succeeded.
    fn repair(&self, segment_id: SegmentId, original_len: u64, shards: &[Option<Vec<u8>>]) {
        let (on_disk, _, _) = self.gather(segment_id);
        for (i, (have, want)) in on_disk.iter().zip(shards.iter()).enumerate() {
            let (None, Some(shard)) = (have, want) else {
                continue;
            };
            let drive = &self.config.base_folder_paths_across_drives[i];
            let framed = encode_shard(segment_id, i as u32, original_len, shard);
            match self.write_shard(drive, segment_id, i, &framed) {
                Ok(()) => debug!(segment = %segment_id, shard = i, "shard re-materialized"),
                Err(e) => warn!(segment = %segment_id, shard = i, error = %e, "shard repair failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dirs: &[TempDir], data: usize, parity: usize, repair: bool) -> ErasureBlobStore {
        let mut config = ErasureCodingConfig::new(
            data,
            parity,
            dirs.iter().map(|d| d.path().to_path_buf()).collect(),
        );
        config.repair_corrupted_shards = repair;
        ErasureBlobStore::new(config).unwrap()
    }

    fn drives(n: usize) -> Vec<TempDir> {
        (0..n).map(|_| TempDir::new().unwrap()).collect()
    }

    #[test]
    fn round_trip_all_shards_present() {
        let dirs = drives(4);
        let store = store(&dirs, 2, 2, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        store.write(&ctx, id, &payload).unwrap();
        assert_eq!(store.read(&ctx, id).unwrap(), payload);
    }

    #[test]
    fn survives_parity_many_losses() {
        let dirs = drives(4);
        let store = store(&dirs, 2, 2, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        let payload = vec![7u8; 64 * 1024];
        store.write(&ctx, id, &payload).unwrap();

        // Delete one data shard and one parity shard.
        for i in [0usize, 3] {
            fs::remove_file(store.shard_path(dirs[i].path(), id, i)).unwrap();
        }
        assert_eq!(store.read(&ctx, id).unwrap(), payload);
    }

    #[test]
    fn too_many_losses_is_data_loss() {
        let dirs = drives(4);
        let store = store(&dirs, 2, 2, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        store.write(&ctx, id, b"bytes").unwrap();
        for i in 0..3 {
            fs::remove_file(store.shard_path(dirs[i].path(), id, i)).unwrap();
        }
        assert!(matches!(store.read(&ctx, id), Err(Error::DataLoss { .. })));
    }

    #[test]
    fn missing_everything_is_not_found() {
        let dirs = drives(3);
        let store = store(&dirs, 2, 1, false);
        assert!(matches!(
            store.read(&Context::new(), SegmentId::new()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn corrupt_shard_counts_as_missing() {
        let dirs = drives(4);
        let store = store(&dirs, 2, 2, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        let payload = vec![9u8; 10_000];
        store.write(&ctx, id, &payload).unwrap();
        fs::write(store.shard_path(dirs[1].path(), id, 1), b"scribble").unwrap();
        assert_eq!(store.read(&ctx, id).unwrap(), payload);
    }

    #[test]
    fn auto_repair_rematerializes_missing_shard() {
        let dirs = drives(4);
        let store = store(&dirs, 2, 2, true);
        let ctx = Context::new();
        let id = SegmentId::new();
        let payload = vec![3u8; 1 << 20];
        store.write(&ctx, id, &payload).unwrap();

        let victim = store.shard_path(dirs[2].path(), id, 2);
        fs::remove_file(&victim).unwrap();
        assert_eq!(store.read(&ctx, id).unwrap(), payload);
        assert!(victim.exists(), "repair should have rewritten the shard");

        // The repaired shard is a valid frame.
        let frame = decode_shard(&fs::read(&victim).unwrap(), id).unwrap();
        assert_eq!(frame.shard_index, 2);
    }

    #[test]
    fn empty_payload_round_trips() {
        let dirs = drives(3);
        let store = store(&dirs, 2, 1, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        store.write(&ctx, id, b"").unwrap();
        assert_eq!(store.read(&ctx, id).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn remove_deletes_every_shard() {
        let dirs = drives(3);
        let store = store(&dirs, 2, 1, false);
        let ctx = Context::new();
        let id = SegmentId::new();
        store.write(&ctx, id, b"payload").unwrap();
        store.remove(&ctx, id).unwrap();
        for (i, dir) in dirs.iter().enumerate() {
            assert!(!store.shard_path(dir.path(), id, i).exists());
        }
        assert!(matches!(
            store.read(&ctx, id),
            Err(Error::NotFound { .. })
        ));
    }
}
