//! The seam between the tree algorithm and whatever holds its nodes.
//!
//! The transaction layer implements `NodeStore` so every node read lands in
//! the read set and every mutation stages a rewrite; tests implement it
//! over plain maps. The tree itself never talks to the registry, blob store
//! or cache directly.

use crate::node::{Node, ValueRef};
use sop_core::{KeyComparator, LogicalId, Result, ValuePlacement};
use std::sync::Arc;

/// Node and value access for one store, bound to one transaction.
pub trait NodeStore {
    /// The comparator this store sorts with.
    fn comparator(&self) -> &KeyComparator;

    /// Maximum slots per leaf and separators per interior node.
    fn slot_length(&self) -> usize;

    fn is_unique(&self) -> bool;

    fn leaf_load_balancing(&self) -> bool;

    fn value_placement(&self) -> ValuePlacement;

    /// Current root, `None` while the tree is empty.
    fn root(&self) -> Option<LogicalId>;

    fn set_root(&mut self, root: Option<LogicalId>) -> Result<()>;

    fn item_count(&self) -> u64;

    fn set_item_count(&mut self, count: u64) -> Result<()>;

    /// Fetch a node. Reads are version-tracked by the implementation.
    fn read_node(&mut self, id: LogicalId) -> Result<Arc<Node>>;

    /// Allocate an id for a brand-new node.
    fn allocate_node_id(&mut self) -> LogicalId;

    /// Stage a created or rewritten node under its own id.
    fn stage_node(&mut self, node: Node) -> Result<()>;

    /// Stage deletion of a node (after a merge, or store teardown).
    fn delete_node(&mut self, id: LogicalId) -> Result<()>;

    /// Place value bytes per the store's value placement.
    fn write_value(&mut self, bytes: &[u8]) -> Result<ValueRef>;

    /// Fetch value bytes back from wherever they were placed.
    fn read_value(&mut self, value: &ValueRef) -> Result<Vec<u8>>;

    /// Release a value that is no longer referenced by any slot.
    fn delete_value(&mut self, value: &ValueRef) -> Result<()>;
}
