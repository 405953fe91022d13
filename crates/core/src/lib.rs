//! Shared foundation for the SOP engine: identifiers, keys and comparators,
//! store metadata, configuration, the unified error model and the
//! cancellation context.
//!
//! Nothing here touches storage; the heavier crates (`sop-storage`,
//! `sop-btree`, `sop-concurrency`, `sop-engine`) all build on these types.

#![warn(clippy::all)]

pub mod cel;
pub mod config;
pub mod context;
pub mod error;
pub mod index;
pub mod key;
pub mod store_info;
pub mod types;

pub use cel::ComparatorExpression;
pub use config::{
    CacheConfig, DatabaseKind, DatabaseOptions, ErasureCodingConfig, RedisCacheConfig,
    StoreOptions, TransactionMode, TransactionOptions, ValueDataSize, MAX_REGISTRY_HASH_MOD,
    MIN_REGISTRY_HASH_MOD,
};
pub use context::Context;
pub use error::{CommitPhase, Error, Result};
pub use index::{IndexFieldSpecification, IndexSpecification, KeyComparator};
pub use key::{FieldValue, Key};
pub use store_info::{KeyKind, StoreInfo, ValuePlacement};
pub use types::{DatabaseId, Handle, ItemId, LogicalId, SegmentId, StoreId, TransactionId};
