//! In-memory `NodeStore` for unit and property tests.
//!
//! Behaves like a store view with every staging operation applied
//! immediately: nodes in a map, separate values in a second map keyed by
//! fabricated segment ids. No versioning, no caching, no I/O.

use crate::node::{Node, ValueRef};
use crate::store::NodeStore;
use sop_core::{Error, Key, KeyComparator, LogicalId, Result, SegmentId, ValuePlacement};
use std::collections::HashMap;
use std::sync::Arc;

pub struct MemoryNodeStore {
    pub comparator: KeyComparator,
    pub slot_length: usize,
    pub unique: bool,
    pub load_balancing: bool,
    pub placement: ValuePlacement,
    root: Option<LogicalId>,
    item_count: u64,
    nodes: HashMap<LogicalId, Arc<Node>>,
    values: HashMap<SegmentId, Vec<u8>>,
}

impl MemoryNodeStore {
    pub fn new(slot_length: usize, unique: bool) -> Self {
        MemoryNodeStore {
            comparator: KeyComparator::natural(),
            slot_length,
            unique,
            load_balancing: false,
            placement: ValuePlacement::InNode,
            root: None,
            item_count: 0,
            nodes: HashMap::new(),
            values: HashMap::new(),
        }
    }

    pub fn with_comparator(mut self, comparator: KeyComparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_load_balancing(mut self) -> Self {
        self.load_balancing = true;
        self
    }

    pub fn with_placement(mut self, placement: ValuePlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn separate_value_count(&self) -> usize {
        self.values.len()
    }

    /// Walk the tree checking the structural invariants: in-order slots,
    /// consistent leaf links, interior fan-out, and item count. Panics on
    /// violation so tests fail loudly.
    pub fn check_invariants(&self) {
        let Some(root) = self.root else {
            assert_eq!(self.item_count, 0, "empty tree must count zero items");
            return;
        };
        let mut leaf_items = 0u64;
        let mut leaves = Vec::new();
        self.walk(root, &mut leaf_items, &mut leaves);
        assert_eq!(
            leaf_items, self.item_count,
            "item_count must equal reachable leaf slots"
        );
        // Leaf chain must visit the same leaves in the same order.
        for pair in leaves.windows(2) {
            let left = &self.nodes[&pair[0]];
            let right = &self.nodes[&pair[1]];
            assert_eq!(left.next_leaf, Some(pair[1]), "broken next link");
            assert_eq!(right.prev_leaf, Some(pair[0]), "broken prev link");
        }
        if let Some(first) = leaves.first() {
            assert_eq!(self.nodes[first].prev_leaf, None);
        }
        if let Some(last) = leaves.last() {
            assert_eq!(self.nodes[last].next_leaf, None);
        }
    }

    fn walk(&self, id: LogicalId, leaf_items: &mut u64, leaves: &mut Vec<LogicalId>) {
        let node = self.nodes.get(&id).expect("reachable node exists");
        if node.is_leaf {
            for pair in node.slots.windows(2) {
                let ord = self
                    .comparator
                    .compare(&pair[0].key, &pair[1].key)
                    .then(pair[0].item_id.cmp(&pair[1].item_id));
                assert!(ord.is_lt(), "leaf slots out of order");
            }
            *leaf_items += node.slots.len() as u64;
            leaves.push(id);
        } else {
            assert_eq!(node.children.len(), node.keys.len() + 1, "bad fan-out");
            assert!(!node.keys.is_empty() || self.root == Some(id));
            for child in &node.children {
                self.walk(*child, leaf_items, leaves);
            }
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn comparator(&self) -> &KeyComparator {
        &self.comparator
    }

    fn slot_length(&self) -> usize {
        self.slot_length
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn leaf_load_balancing(&self) -> bool {
        self.load_balancing
    }

    fn value_placement(&self) -> ValuePlacement {
        self.placement
    }

    fn root(&self) -> Option<LogicalId> {
        self.root
    }

    fn set_root(&mut self, root: Option<LogicalId>) -> Result<()> {
        self.root = root;
        Ok(())
    }

    fn item_count(&self) -> u64 {
        self.item_count
    }

    fn set_item_count(&mut self, count: u64) -> Result<()> {
        self.item_count = count;
        Ok(())
    }

    fn read_node(&mut self, id: LogicalId) -> Result<Arc<Node>> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::internal(format!("node {} not found", id)))
    }

    fn allocate_node_id(&mut self) -> LogicalId {
        LogicalId::new()
    }

    fn stage_node(&mut self, node: Node) -> Result<()> {
        self.nodes.insert(node.node_id, Arc::new(node));
        Ok(())
    }

    fn delete_node(&mut self, id: LogicalId) -> Result<()> {
        self.nodes.remove(&id);
        Ok(())
    }

    fn write_value(&mut self, bytes: &[u8]) -> Result<ValueRef> {
        match self.placement {
            ValuePlacement::InNode => Ok(ValueRef::Inline(bytes.to_vec())),
            ValuePlacement::SeparateCached | ValuePlacement::SeparatePersisted => {
                let id = SegmentId::new();
                self.values.insert(id, bytes.to_vec());
                Ok(ValueRef::Blob(id))
            }
        }
    }

    fn read_value(&mut self, value: &ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Inline(bytes) => Ok(bytes.clone()),
            ValueRef::Blob(id) => self
                .values
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("value segment {}", id))),
        }
    }

    fn delete_value(&mut self, value: &ValueRef) -> Result<()> {
        if let ValueRef::Blob(id) = value {
            self.values.remove(id);
        }
        Ok(())
    }
}
