//! Layered cache: L1 always, L2 when the deployment supplies one.
//!
//! Reads check L1, then L2 (promoting hits into L1). Writes always land in
//! L1 and go to L2 only when the object class is shared across processes
//! (nodes, registry entries, store-info, and value blobs marked globally
//! cached). The version guard applies at both levels: stale entries are
//! misses and are evicted where they are found.

use crate::cache::l1::L1Cache;
use crate::cache::{CacheClass, CachedValue, DistributedCache};
use sop_core::Result;
use std::sync::Arc;
use std::time::Duration;

pub struct CacheStack {
    l1: L1Cache,
    l2: Option<Arc<dyn DistributedCache>>,
}

impl CacheStack {
    pub fn new(l2: Option<Arc<dyn DistributedCache>>) -> Self {
        CacheStack {
            l1: L1Cache::new(),
            l2,
        }
    }

    pub fn has_l2(&self) -> bool {
        self.l2.is_some()
    }

    /// The distributed backend, for lock management.
    pub fn l2(&self) -> Option<Arc<dyn DistributedCache>> {
        self.l2.clone()
    }

    fn l2_key(class: CacheClass, key: &str) -> String {
        format!("{}:{}", class.prefix(), key)
    }

    pub fn get(
        &self,
        class: CacheClass,
        key: &str,
        min_version: u64,
    ) -> Result<Option<CachedValue>> {
        if let Some(hit) = self.l1.get(class, key, min_version) {
            return Ok(Some(hit));
        }
        let Some(l2) = &self.l2 else {
            return Ok(None);
        };
        let l2_key = Self::l2_key(class, key);
        match l2.get(&l2_key)? {
            Some(value) if value.version >= min_version => {
                // Promote so the next read stays in-process.
                self.l1.put(class, key, value.clone(), None, false);
                Ok(Some(value))
            }
            Some(_) => {
                // Stale for every reader entitled to min_version.
                l2.invalidate(&l2_key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// `shared` controls whether the entry is visible to other processes
    /// through L2.
    pub fn put(
        &self,
        class: CacheClass,
        key: &str,
        value: CachedValue,
        ttl: Option<Duration>,
        sliding: bool,
        shared: bool,
    ) -> Result<()> {
        self.l1.put(class, key, value.clone(), ttl, sliding);
        if shared {
            if let Some(l2) = &self.l2 {
                l2.put(&Self::l2_key(class, key), value, ttl, sliding)?;
            }
        }
        Ok(())
    }

    pub fn invalidate(&self, class: CacheClass, key: &str) -> Result<()> {
        self.l1.invalidate(class, key);
        if let Some(l2) = &self.l2 {
            l2.invalidate(&Self::l2_key(class, key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::l2_mem::MemoryL2Cache;

    #[test]
    fn l2_hit_promotes_to_l1() {
        let l2 = Arc::new(MemoryL2Cache::new());
        let stack = CacheStack::new(Some(l2.clone() as Arc<dyn DistributedCache>));
        l2.put(
            "nd:n1",
            CachedValue::new(4, b"node".to_vec()),
            None,
            false,
        )
        .unwrap();

        let hit = stack.get(CacheClass::Node, "n1", 4).unwrap().unwrap();
        assert_eq!(hit.bytes, b"node".to_vec());
        // Now served from L1 even if L2 loses the entry.
        l2.invalidate("nd:n1").unwrap();
        assert!(stack.get(CacheClass::Node, "n1", 4).unwrap().is_some());
    }

    #[test]
    fn stale_l2_entry_is_evicted() {
        let l2 = Arc::new(MemoryL2Cache::new());
        let stack = CacheStack::new(Some(l2.clone() as Arc<dyn DistributedCache>));
        l2.put("nd:n1", CachedValue::new(2, vec![]), None, false)
            .unwrap();
        assert!(stack.get(CacheClass::Node, "n1", 3).unwrap().is_none());
        assert!(l2.get("nd:n1").unwrap().is_none());
    }

    #[test]
    fn unshared_put_stays_local() {
        let l2 = Arc::new(MemoryL2Cache::new());
        let stack = CacheStack::new(Some(l2.clone() as Arc<dyn DistributedCache>));
        stack
            .put(
                CacheClass::ValueBlob,
                "v1",
                CachedValue::new(1, b"big".to_vec()),
                None,
                false,
                false,
            )
            .unwrap();
        assert!(l2.get("vb:v1").unwrap().is_none());
        assert!(stack.get(CacheClass::ValueBlob, "v1", 1).unwrap().is_some());
    }

    #[test]
    fn works_without_l2() {
        let stack = CacheStack::new(None);
        stack
            .put(
                CacheClass::StoreInfo,
                "s",
                CachedValue::new(1, vec![9]),
                None,
                false,
                true,
            )
            .unwrap();
        assert_eq!(
            stack.get(CacheClass::StoreInfo, "s", 1).unwrap().unwrap().bytes,
            vec![9]
        );
    }
}
