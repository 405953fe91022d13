//! Storage data plane for SOP: blob segments (plain, replicated or
//! erasure-coded), the authoritative registry, the layered cache with
//! lease locks, and retention-based segment reclamation.
//!
//! Everything here is mechanism; policy (what to write when, what a commit
//! means) lives in `sop-concurrency` and `sop-engine`.

#![warn(clippy::all)]

pub mod blob;
pub mod cache;
pub mod reclaim;
pub mod registry;

pub use blob::erasure::ErasureBlobStore;
pub use blob::local::FileBlobStore;
pub use blob::BlobStore;
pub use cache::l1::L1Cache;
pub use cache::l2_mem::MemoryL2Cache;
pub use cache::lock::{LockManager, LockSet, RetryPolicy};
pub use cache::redis::RedisCache;
pub use cache::stack::CacheStack;
pub use cache::{CacheClass, CachedValue, DistributedCache};
pub use reclaim::{ReclamationQueue, DEFAULT_RETENTION};
pub use registry::file::FileRegistry;
pub use registry::mem::MemoryRegistry;
pub use registry::{Registry, RegistryEntry, RegistryUpdate};
