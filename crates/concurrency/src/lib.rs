//! Optimistic MVCC transactions for SOP.
//!
//! A `Transaction` binds any number of stores in one database, gives each a
//! `NodeStore` view for the B-tree engine, and commits everything through a
//! phased protocol whose linearization point is a single multi-entry
//! registry CAS. Conflicts surface as `ConflictRetryable`; the engine never
//! re-runs caller code on its own.

#![warn(clippy::all)]

pub mod commit_log;
pub mod manager;
pub mod retry;
pub mod transaction;

pub use retry::with_io_retries;
pub use transaction::{store_info_logical_id, StoreView, Transaction, TxState};
