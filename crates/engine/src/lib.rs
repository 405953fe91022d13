//! SOP engine: databases, the transactional store catalog, user-facing
//! store handles, and the vector and model stores layered on top.
//!
//! This crate wires the data plane (`sop-storage`), the tree algorithm
//! (`sop-btree`) and the transaction manager (`sop-concurrency`) into the
//! public API: set up a database, begin a transaction, create/open stores,
//! operate, commit.

#![warn(clippy::all)]

pub mod catalog;
pub mod database;
pub mod model;
pub mod store;
pub mod vector;

pub use catalog::CATALOG_STORE_NAME;
pub use database::{Database, DbTransaction};
pub use model::{ModelManifest, ModelStore, CHUNK_SIZE};
pub use store::BtreeStore;
pub use vector::{SearchHit, VectorStore, DEFAULT_NPROBE};
