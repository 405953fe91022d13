//! Standalone registry: one authoritative, hash-mod-bucketed file.
//!
//! # Layout
//!
//! ```text
//! page 0                      header (magic, version, total_pages, hash_mod)
//! pages 1..=hash_mod          primary buckets
//! pages hash_mod+1..          overflow buckets, appended on demand
//! ```
//!
//! Every page is 4096 bytes. A bucket page holds a crc32 (over the rest of
//! the page), a used-entry count, an overflow page link and up to 102
//! fixed-width entries of `logical id (16) | segment id (16) | version (8)`.
//! A logical id hashes to bucket `id % hash_mod`; ids that overflow their
//! bucket chain into overflow pages at the file tail.
//!
//! Mutations run under an `fs2` exclusive lock on the whole file (plus an
//! in-process mutex, since advisory locks do not exclude handles within one
//! process), which is what makes a multi-entry `cas_update` atomic and
//! totally ordered. At the minimum hash-mod of 250 the bucket region is
//! exactly 1 MiB.

use crate::registry::{Registry, RegistryEntry, RegistryUpdate};
use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use parking_lot::Mutex;
use sop_core::{Context, Error, LogicalId, Result, SegmentId};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PAGE_SIZE: usize = 4096;
const HEADER_MAGIC: [u8; 4] = *b"SOPR";
const FORMAT_VERSION: u32 = 1;
const BUCKET_HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 40;
/// Entries per bucket page.
pub const BUCKET_CAPACITY: usize = (PAGE_SIZE - BUCKET_HEADER_SIZE) / ENTRY_SIZE;

struct Inner {
    file: File,
    total_pages: u64,
}

/// File-backed registry for standalone databases.
pub struct FileRegistry {
    inner: Mutex<Inner>,
    hash_mod: u64,
    path: PathBuf,
}

/// Scoped advisory lock over a duplicated handle, so the guard borrows
/// nothing. Unlock failure is ignored; process exit releases the lock.
struct FileLock(File);

impl FileLock {
    fn exclusive(file: &File) -> Result<Self> {
        let dup = file.try_clone()?;
        dup.lock_exclusive()?;
        Ok(FileLock(dup))
    }

    fn shared(file: &File) -> Result<Self> {
        let dup = file.try_clone()?;
        dup.lock_shared()?;
        Ok(FileLock(dup))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

fn page_crc(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[4..]);
    hasher.finalize()
}

fn seal_page(page: &mut [u8; PAGE_SIZE]) {
    let crc = page_crc(page);
    LittleEndian::write_u32(&mut page[0..4], crc);
}

fn page_used(page: &[u8; PAGE_SIZE]) -> usize {
    LittleEndian::read_u16(&page[4..6]) as usize
}

fn set_page_used(page: &mut [u8; PAGE_SIZE], used: usize) {
    LittleEndian::write_u16(&mut page[4..6], used as u16);
}

fn page_overflow(page: &[u8; PAGE_SIZE]) -> u64 {
    LittleEndian::read_u64(&page[8..16])
}

fn set_page_overflow(page: &mut [u8; PAGE_SIZE], overflow: u64) {
    LittleEndian::write_u64(&mut page[8..16], overflow);
}

fn entry_at(page: &[u8; PAGE_SIZE], slot: usize) -> RegistryEntry {
    let off = BUCKET_HEADER_SIZE + slot * ENTRY_SIZE;
    let logical_id = LogicalId::from_bytes(page[off..off + 16].try_into().unwrap());
    let segment_id = SegmentId::from_bytes(page[off + 16..off + 32].try_into().unwrap());
    let version = LittleEndian::read_u64(&page[off + 32..off + 40]);
    RegistryEntry {
        logical_id,
        segment_id,
        version,
    }
}

fn write_entry_at(page: &mut [u8; PAGE_SIZE], slot: usize, entry: &RegistryEntry) {
    let off = BUCKET_HEADER_SIZE + slot * ENTRY_SIZE;
    page[off..off + 16].copy_from_slice(entry.logical_id.as_bytes());
    page[off + 16..off + 32].copy_from_slice(entry.segment_id.as_bytes());
    LittleEndian::write_u64(&mut page[off + 32..off + 40], entry.version);
}

/// Pages loaded during one operation, written back together at the end.
struct PageSet<'a> {
    inner: &'a mut Inner,
    pages: HashMap<u64, Box<[u8; PAGE_SIZE]>>,
    dirty: Vec<u64>,
}

impl<'a> PageSet<'a> {
    fn new(inner: &'a mut Inner) -> Self {
        PageSet {
            inner,
            pages: HashMap::new(),
            dirty: Vec::new(),
        }
    }

    fn load(&mut self, page_idx: u64) -> Result<&mut Box<[u8; PAGE_SIZE]>> {
        if !self.pages.contains_key(&page_idx) {
            let mut buf = Box::new([0u8; PAGE_SIZE]);
            self.inner
                .file
                .seek(SeekFrom::Start(page_idx * PAGE_SIZE as u64))?;
            self.inner.file.read_exact(&mut buf[..])?;
            let stored = LittleEndian::read_u32(&buf[0..4]);
            if stored != page_crc(&buf[..]) {
                return Err(Error::data_loss(format!(
                    "registry page {} failed integrity check",
                    page_idx
                )));
            }
            self.pages.insert(page_idx, buf);
        }
        Ok(self.pages.get_mut(&page_idx).unwrap())
    }

    fn mark_dirty(&mut self, page_idx: u64) {
        if !self.dirty.contains(&page_idx) {
            self.dirty.push(page_idx);
        }
    }

    /// Append a fresh, empty overflow page to the file tail.
    fn allocate(&mut self) -> u64 {
        let page_idx = self.inner.total_pages;
        self.inner.total_pages += 1;
        let mut page = Box::new([0u8; PAGE_SIZE]);
        seal_page(&mut page);
        self.pages.insert(page_idx, page);
        self.mark_dirty(page_idx);
        page_idx
    }

    /// Walk the chain looking for `id`. Returns the hit (page, slot, entry)
    /// if present, the first free slot seen, and the chain tail page.
    #[allow(clippy::type_complexity)]
    fn find(
        &mut self,
        first_page: u64,
        id: LogicalId,
    ) -> Result<(Option<(u64, usize, RegistryEntry)>, Option<(u64, usize)>, u64)> {
        let mut page_idx = first_page;
        let mut free_slot = None;
        loop {
            let page = self.load(page_idx)?;
            let used = page_used(page);
            for slot in 0..used {
                let entry = entry_at(page, slot);
                if entry.logical_id == id {
                    return Ok((Some((page_idx, slot, entry)), free_slot, page_idx));
                }
            }
            if free_slot.is_none() && used < BUCKET_CAPACITY {
                free_slot = Some((page_idx, used));
            }
            let next = page_overflow(page);
            if next == 0 {
                return Ok((None, free_slot, page_idx));
            }
            page_idx = next;
        }
    }

    /// Insert or overwrite one entry, assuming version validation already
    /// passed for the whole batch.
    fn apply(&mut self, first_page: u64, entry: RegistryEntry) -> Result<()> {
        let (found, free_slot, tail) = self.find(first_page, entry.logical_id)?;
        match found {
            Some((page_idx, slot, _)) => {
                let page = self.load(page_idx)?;
                write_entry_at(page, slot, &entry);
                self.mark_dirty(page_idx);
            }
            None => {
                let (page_idx, slot) = match free_slot {
                    Some(place) => place,
                    None => {
                        let new_page = self.allocate();
                        let tail_page = self.load(tail)?;
                        set_page_overflow(tail_page, new_page);
                        self.mark_dirty(tail);
                        (new_page, 0)
                    }
                };
                let page = self.load(page_idx)?;
                debug_assert_eq!(slot, page_used(page));
                write_entry_at(page, slot, &entry);
                set_page_used(page, slot + 1);
                self.mark_dirty(page_idx);
            }
        }
        Ok(())
    }

    fn flush(mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.dirty.sort_unstable();
        for page_idx in &self.dirty {
            let page = self.pages.get_mut(page_idx).unwrap();
            seal_page(page);
            self.inner
                .file
                .seek(SeekFrom::Start(page_idx * PAGE_SIZE as u64))?;
            self.inner.file.write_all(&page[..])?;
        }
        // Keep the header's total_pages in step with allocations.
        let mut header = Box::new([0u8; PAGE_SIZE]);
        self.inner.file.seek(SeekFrom::Start(0))?;
        self.inner.file.read_exact(&mut header[..])?;
        LittleEndian::write_u64(&mut header[16..24], self.inner.total_pages);
        seal_page(&mut header);
        self.inner.file.seek(SeekFrom::Start(0))?;
        self.inner.file.write_all(&header[..])?;
        self.inner.file.sync_data()?;
        Ok(())
    }
}

impl FileRegistry {
    /// Open or create the registry file under `folder`. An existing file's
    /// stored hash-mod wins over the argument; the bucket geometry of a
    /// populated registry cannot change.
    pub fn open(folder: &Path, hash_mod: usize) -> Result<Self> {
        std::fs::create_dir_all(folder)?;
        let path = folder.join("registry.dat");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let guard = FileLock::exclusive(&file)?;

        let len = file.metadata()?.len();
        let (hash_mod, total_pages) = if len == 0 {
            Self::initialize(&mut file, hash_mod as u64)?;
            (hash_mod as u64, 1 + hash_mod as u64)
        } else {
            let mut header = Box::new([0u8; PAGE_SIZE]);
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header[..])?;
            let stored_crc = LittleEndian::read_u32(&header[0..4]);
            if stored_crc != page_crc(&header[..]) {
                return Err(Error::data_loss(format!(
                    "registry header of {:?} failed integrity check",
                    path
                )));
            }
            if header[4..8] != HEADER_MAGIC {
                return Err(Error::data_loss(format!(
                    "registry file {:?} has bad magic",
                    path
                )));
            }
            let version = LittleEndian::read_u32(&header[8..12]);
            if version != FORMAT_VERSION {
                return Err(Error::invalid_config(format!(
                    "registry format version {} is not supported",
                    version
                )));
            }
            let total_pages = LittleEndian::read_u64(&header[16..24]);
            let hash_mod = LittleEndian::read_u64(&header[24..32]);
            (hash_mod, total_pages)
        };
        drop(guard);

        debug!(?path, hash_mod, total_pages, "registry opened");
        Ok(FileRegistry {
            inner: Mutex::new(Inner { file, total_pages }),
            hash_mod,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_mod(&self) -> usize {
        self.hash_mod as usize
    }

    fn initialize(file: &mut File, hash_mod: u64) -> Result<()> {
        let mut header = Box::new([0u8; PAGE_SIZE]);
        header[4..8].copy_from_slice(&HEADER_MAGIC);
        LittleEndian::write_u32(&mut header[8..12], FORMAT_VERSION);
        LittleEndian::write_u64(&mut header[16..24], 1 + hash_mod);
        LittleEndian::write_u64(&mut header[24..32], hash_mod);
        seal_page(&mut header);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header[..])?;

        let mut bucket = Box::new([0u8; PAGE_SIZE]);
        seal_page(&mut bucket);
        for _ in 0..hash_mod {
            file.write_all(&bucket[..])?;
        }
        file.sync_all()?;
        Ok(())
    }

    fn bucket_page(&self, id: LogicalId) -> u64 {
        let hash = LittleEndian::read_u64(&id.as_bytes()[0..8]);
        1 + hash % self.hash_mod
    }
}

impl Registry for FileRegistry {
    fn lookup(&self, ctx: &Context, ids: &[LogicalId]) -> Result<Vec<Option<RegistryEntry>>> {
        ctx.check()?;
        let mut inner = self.inner.lock();
        let _guard = FileLock::shared(&inner.file)?;
        let mut pages = PageSet::new(&mut inner);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let bucket = self.bucket_page(*id);
            let (found, _, _) = pages.find(bucket, *id)?;
            out.push(found.map(|(_, _, entry)| entry));
        }
        Ok(out)
    }

    fn cas_update(&self, ctx: &Context, updates: &[RegistryUpdate]) -> Result<()> {
        ctx.check()?;
        if updates.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let _guard = FileLock::exclusive(&inner.file)?;
        let mut pages = PageSet::new(&mut inner);

        // Validate the whole batch first so a conflicted batch leaves no
        // trace on disk.
        let mut offenders = Vec::new();
        for update in updates {
            let bucket = self.bucket_page(update.logical_id);
            let (found, _, _) = pages.find(bucket, update.logical_id)?;
            let current = found.map(|(_, _, e)| e.version).unwrap_or(0);
            if current != update.expected_version {
                offenders.push(update.logical_id);
            }
        }
        if !offenders.is_empty() {
            return Err(Error::conflict(offenders));
        }

        for update in updates {
            let bucket = self.bucket_page(update.logical_id);
            pages.apply(
                bucket,
                RegistryEntry {
                    logical_id: update.logical_id,
                    segment_id: update.segment_id,
                    version: update.version,
                },
            )?;
        }
        pages.flush()
    }

    fn remove(&self, ctx: &Context, ids: &[LogicalId]) -> Result<()> {
        ctx.check()?;
        let mut inner = self.inner.lock();
        let _guard = FileLock::exclusive(&inner.file)?;
        let mut pages = PageSet::new(&mut inner);
        for id in ids {
            let bucket = self.bucket_page(*id);
            let (found, _, _) = pages.find(bucket, *id)?;
            let Some((page_idx, slot, _)) = found else {
                continue;
            };
            let page = pages.load(page_idx)?;
            let used = page_used(page);
            // Swap-remove within the page; overflow pages are not compacted.
            if slot + 1 < used {
                let last = entry_at(page, used - 1);
                write_entry_at(page, slot, &last);
            }
            set_page_used(page, used - 1);
            pages.mark_dirty(page_idx);
        }
        pages.flush()
    }
}
