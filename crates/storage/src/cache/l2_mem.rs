//! In-process implementation of the distributed-cache contract.
//!
//! Standalone databases and tests use this; it keeps the L2 code path (and
//! the lock semantics) identical whether or not a real distributed cache is
//! deployed.

use crate::cache::{CachedValue, DistributedCache};
use dashmap::DashMap;
use sop_core::Result;
use std::time::{Duration, Instant};

struct Slot {
    value: CachedValue,
    expires_at: Option<Instant>,
    ttl: Option<Duration>,
    sliding: bool,
}

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryL2Cache {
    slots: DashMap<String, Slot>,
    leases: DashMap<String, Lease>,
}

impl MemoryL2Cache {
    pub fn new() -> Self {
        MemoryL2Cache::default()
    }
}

impl DistributedCache for MemoryL2Cache {
    fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let mut slot = match self.slots.get_mut(key) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let now = Instant::now();
        if let Some(expires_at) = slot.expires_at {
            if now > expires_at {
                drop(slot);
                self.slots.remove(key);
                return Ok(None);
            }
        }
        if slot.sliding {
            if let Some(ttl) = slot.ttl {
                slot.expires_at = Some(now + ttl);
            }
        }
        Ok(Some(slot.value.clone()))
    }

    fn put(
        &self,
        key: &str,
        value: CachedValue,
        ttl: Option<Duration>,
        sliding: bool,
    ) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
                ttl,
                sliding,
            },
        );
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut acquired = false;
        // The entry API gives us the atomic check-and-set a real distributed
        // cache does with SET NX PX.
        self.leases
            .entry(key.to_string())
            .and_modify(|held| {
                if held.owner == owner || now > held.expires_at {
                    held.owner = owner.to_string();
                    held.expires_at = now + lease;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Lease {
                    owner: owner.to_string(),
                    expires_at: now + lease,
                }
            });
        Ok(acquired)
    }

    fn renew_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut renewed = false;
        if let Some(mut held) = self.leases.get_mut(key) {
            if held.owner == owner && now <= held.expires_at {
                held.expires_at = now + lease;
                renewed = true;
            }
        }
        Ok(renewed)
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool> {
        let removed = self
            .leases
            .remove_if(key, |_, held| held.owner == owner)
            .is_some();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip_and_invalidate() {
        let cache = MemoryL2Cache::new();
        cache
            .put("k", CachedValue::new(2, b"abc".to_vec()), None, false)
            .unwrap();
        assert_eq!(cache.get("k").unwrap().unwrap().version, 2);
        cache.invalidate("k").unwrap();
        assert!(cache.get("k").unwrap().is_none());
    }

    #[test]
    fn lock_excludes_other_owner() {
        let cache = MemoryL2Cache::new();
        let lease = Duration::from_secs(30);
        assert!(cache.try_lock("L", "alpha", lease).unwrap());
        assert!(!cache.try_lock("L", "beta", lease).unwrap());
        // Same owner refreshes.
        assert!(cache.try_lock("L", "alpha", lease).unwrap());
        assert!(cache.unlock("L", "alpha").unwrap());
        assert!(cache.try_lock("L", "beta", lease).unwrap());
    }

    #[test]
    fn expired_lease_is_stealable() {
        let cache = MemoryL2Cache::new();
        assert!(cache
            .try_lock("L", "alpha", Duration::from_millis(1))
            .unwrap());
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.try_lock("L", "beta", Duration::from_secs(5)).unwrap());
        // Alpha's lease is gone; renew and unlock must refuse.
        assert!(!cache
            .renew_lock("L", "alpha", Duration::from_secs(5))
            .unwrap());
        assert!(!cache.unlock("L", "alpha").unwrap());
    }

    #[test]
    fn renew_extends_held_lease() {
        let cache = MemoryL2Cache::new();
        assert!(cache.try_lock("L", "alpha", Duration::from_secs(1)).unwrap());
        assert!(cache.renew_lock("L", "alpha", Duration::from_secs(30)).unwrap());
    }
}
