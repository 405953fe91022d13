//! In-process cache, always present.
//!
//! Version-guarded get: an entry older than the version the caller is
//! entitled to is treated as a miss and evicted on the spot. Expiry is
//! lazy; there is no sweeper thread, entries die when touched.

use crate::cache::{CacheClass, CachedValue};
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: CachedValue,
    expires_at: Option<Instant>,
    ttl: Option<Duration>,
    sliding: bool,
}

/// Per-process cache over all object classes.
#[derive(Default)]
pub struct L1Cache {
    entries: DashMap<(CacheClass, String), Entry>,
}

impl L1Cache {
    pub fn new() -> Self {
        L1Cache::default()
    }

    /// Fetch `key` if present, unexpired and at least `min_version`.
    pub fn get(&self, class: CacheClass, key: &str, min_version: u64) -> Option<CachedValue> {
        let map_key = (class, key.to_string());
        let mut hit = match self.entries.get_mut(&map_key) {
            Some(entry) => entry,
            None => return None,
        };
        let now = Instant::now();
        if let Some(expires_at) = hit.expires_at {
            if now > expires_at {
                drop(hit);
                self.entries.remove(&map_key);
                return None;
            }
        }
        if hit.value.version < min_version {
            drop(hit);
            self.entries.remove(&map_key);
            return None;
        }
        if hit.sliding {
            if let Some(ttl) = hit.ttl {
                hit.expires_at = Some(now + ttl);
            }
        }
        Some(hit.value.clone())
    }

    /// Insert or refresh; a newer version always wins, an older one is
    /// ignored so a slow writer cannot clobber fresher state.
    pub fn put(
        &self,
        class: CacheClass,
        key: &str,
        value: CachedValue,
        ttl: Option<Duration>,
        sliding: bool,
    ) {
        let map_key = (class, key.to_string());
        if let Some(existing) = self.entries.get(&map_key) {
            if existing.value.version > value.version {
                return;
            }
        }
        self.entries.insert(
            map_key,
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
                ttl,
                sliding,
            },
        );
    }

    pub fn invalidate(&self, class: CacheClass, key: &str) {
        self.entries.remove(&(class, key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
