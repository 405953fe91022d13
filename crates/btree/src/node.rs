//! B-tree node records.
//!
//! The tree is leaf-linked: items live only in leaves, interior nodes hold
//! separator pairs and child pointers. Every comparison inside the tree is
//! on the pair `(key, item_id)`, which makes the order total even for
//! stores that allow duplicate keys; the separator therefore carries the
//! item id alongside the key.
//!
//! Nodes serialize with bincode into one blob segment each. The node id is
//! the logical id the registry tracks; rewriting a node keeps the id and
//! bumps the registered version.

use serde::{Deserialize, Serialize};
use sop_core::{Error, ItemId, Key, KeyComparator, LogicalId, Result, SegmentId};
use std::cmp::Ordering;

/// Where a slot's value bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRef {
    /// Serialized inside the node segment.
    Inline(Vec<u8>),
    /// In a dedicated blob segment.
    Blob(SegmentId),
}

/// One leaf entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub key: Key,
    pub value: ValueRef,
    /// Stable across updates; orders duplicates deterministically.
    pub item_id: ItemId,
    /// Bumped on every value update of this item.
    pub version: u64,
}

/// Separator in an interior node: the `(key, item_id)` pair at which its
/// right neighbor child begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Separator {
    pub key: Key,
    pub item_id: ItemId,
}

/// One B-tree page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: LogicalId,
    pub is_leaf: bool,
    /// Leaf items; empty on interior nodes.
    pub slots: Vec<Slot>,
    /// Interior separators; empty on leaves. `children.len() == keys.len() + 1`.
    pub keys: Vec<Separator>,
    pub children: Vec<LogicalId>,
    pub prev_leaf: Option<LogicalId>,
    pub next_leaf: Option<LogicalId>,
}

impl Node {
    pub fn new_leaf(node_id: LogicalId) -> Self {
        Node {
            node_id,
            is_leaf: true,
            slots: Vec::new(),
            keys: Vec::new(),
            children: Vec::new(),
            prev_leaf: None,
            next_leaf: None,
        }
    }

    pub fn new_interior(
        node_id: LogicalId,
        keys: Vec<Separator>,
        children: Vec<LogicalId>,
    ) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        Node {
            node_id,
            is_leaf: false,
            slots: Vec::new(),
            keys,
            children,
            prev_leaf: None,
            next_leaf: None,
        }
    }

    /// Number of routable entries: slots for leaves, separators for
    /// interior nodes.
    pub fn len(&self) -> usize {
        if self.is_leaf {
            self.slots.len()
        } else {
            self.keys.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::serialization(format!("node record: {}", e)))
    }
}

/// Compare a slot pair against a probe pair under the store comparator,
/// with the item id as tiebreak.
pub fn pair_cmp(
    comparator: &KeyComparator,
    a_key: &Key,
    a_id: ItemId,
    b_key: &Key,
    b_id: ItemId,
) -> Ordering {
    comparator.compare(a_key, b_key).then(a_id.cmp(&b_id))
}
