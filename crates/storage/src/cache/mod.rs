//! Cache layer: in-process L1, optional distributed L2, and lease locks.
//!
//! Four object classes are cached (nodes, registry entries, store-info
//! records, value blobs), each under its own TTL policy. Consistency rule:
//! a cached entry is only returned when its version is at least the version
//! the reader is entitled to; anything older behaves as a miss and is
//! evicted. Distributed locks ride on the same L2 backend because clustered
//! deployments already have it; standalone databases use the in-process
//! implementation.

pub mod l1;
pub mod l2_mem;
pub mod lock;
pub mod redis;
pub mod stack;

use sop_core::Result;
use std::time::Duration;

/// Object classes with independent cache policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    Node,
    RegistryEntry,
    StoreInfo,
    ValueBlob,
}

impl CacheClass {
    /// Key-space prefix; part of the L2 wire format.
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheClass::Node => "nd",
            CacheClass::RegistryEntry => "rg",
            CacheClass::StoreInfo => "si",
            CacheClass::ValueBlob => "vb",
        }
    }
}

/// A cached payload stamped with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub version: u64,
    pub bytes: Vec<u8>,
}

impl CachedValue {
    pub fn new(version: u64, bytes: Vec<u8>) -> Self {
        CachedValue { version, bytes }
    }
}

/// Distributed cache + lease locks. In clustered deployments this is the
/// cross-process coordination surface, so the lock operations live here
/// rather than in a separate service.
pub trait DistributedCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CachedValue>>;

    /// Store a value. `ttl = None` keeps it until invalidated; `sliding`
    /// restarts the clock on every hit.
    fn put(&self, key: &str, value: CachedValue, ttl: Option<Duration>, sliding: bool)
        -> Result<()>;

    fn invalidate(&self, key: &str) -> Result<()>;

    /// Try to take the lease lock `key` for `owner`. Returns false when a
    /// different owner holds an unexpired lease. Re-acquiring one's own
    /// lock refreshes the lease.
    fn try_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Extend a held lease. Returns false when the lease was lost (expired
    /// and possibly taken by someone else).
    fn renew_lock(&self, key: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Release a held lock. Returns false when the lock was not held by
    /// `owner` anymore; releasing someone else's lock is refused.
    fn unlock(&self, key: &str, owner: &str) -> Result<bool>;
}
