//! SOP: transactional, scalable key/value object persistence.
//!
//! Ordered B-tree stores with ACID semantics over a local filesystem
//! (standalone) or a clustered deployment coordinated through an external
//! registry and a distributed cache. A vector store (coarse-quantization
//! ANN) and a model store layer on top and share the same transactions.
//!
//! ```no_run
//! use sop::{Context, Database, DatabaseOptions, Item, Key, StoreOptions, TransactionOptions};
//!
//! fn main() -> sop::Result<()> {
//!     let ctx = Context::new();
//!     let db = Database::create(&ctx, DatabaseOptions::standalone("/tmp/sop/demo"))?;
//!
//!     let tx = db.begin_transaction(&ctx, TransactionOptions::writing())?;
//!     let users = db.new_store(&ctx, &tx, "users", StoreOptions::default(), None)?;
//!     users.add(&ctx, &[Item::new("u1", "Ada")])?;
//!     tx.commit(&ctx)?;
//!
//!     let tx = db.begin_transaction(&ctx, TransactionOptions::reading())?;
//!     let users = db.open_store(&ctx, &tx, "users")?;
//!     assert!(users.find(&ctx, &Key::from("u1"))?);
//!     tx.commit(&ctx)?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub use sop_core::{
    CacheConfig, CommitPhase, ComparatorExpression, Context, DatabaseId, DatabaseKind,
    DatabaseOptions, ErasureCodingConfig, Error, FieldValue, Handle, IndexFieldSpecification,
    IndexSpecification, ItemId, Key, KeyComparator, KeyKind, LogicalId, RedisCacheConfig, Result,
    SegmentId, StoreId, StoreInfo, StoreOptions, TransactionId, TransactionMode,
    TransactionOptions, ValueDataSize, ValuePlacement, MAX_REGISTRY_HASH_MOD,
    MIN_REGISTRY_HASH_MOD,
};

pub use sop_btree::{Item, PagingDirection, PagingInfo};

pub use sop_engine::{
    BtreeStore, Database, DbTransaction, ModelManifest, ModelStore, SearchHit, VectorStore,
    CATALOG_STORE_NAME, CHUNK_SIZE, DEFAULT_NPROBE,
};

/// Lower layers, exposed for advanced embedding (custom registry adapters,
/// direct blob access, cache tuning).
pub mod storage {
    pub use sop_storage::*;
}
