//! The B-tree algorithm over a `NodeStore`.
//!
//! Items live in leaves; interior nodes route on `(key, item_id)` separator
//! pairs, which keeps the in-tree order total even when a store allows
//! duplicate keys (duplicates iterate in item-id order). Leaves form a
//! doubly linked list for cursor motion and paging.
//!
//! Mutations stage whole replacement nodes through the store; nothing is
//! modified in place. The store implementation decides what staging means
//! (an in-memory map for tests, a transaction write set in production).

use crate::node::{pair_cmp, Node, Separator, Slot, ValueRef};
use crate::paging::{PagingDirection, PagingInfo};
use crate::store::NodeStore;
use sop_core::{Error, ItemId, Key, LogicalId, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// One key/value pair with its stable item identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub value: Vec<u8>,
    pub id: ItemId,
}

impl Item {
    /// New item with no id yet; the tree assigns one at insert. Targeting a
    /// specific duplicate requires `with_id`.
    pub fn new(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            id: ItemId::nil(),
        }
    }

    /// Probe item carrying only a key (for lookups).
    pub fn probe(key: impl Into<Key>) -> Self {
        Item {
            key: key.into(),
            value: Vec::new(),
            id: ItemId::nil(),
        }
    }

    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = id;
        self
    }
}

/// Cursor: a leaf and a slot inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    leaf: LogicalId,
    slot: usize,
}

/// B-tree operations bound to one store view.
pub struct Btree<'a, S: NodeStore> {
    store: &'a mut S,
    cursor: Option<Cursor>,
}

impl<'a, S: NodeStore> Btree<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Btree {
            store,
            cursor: None,
        }
    }

    pub fn count(&self) -> u64 {
        self.store.item_count()
    }

    pub fn is_unique(&self) -> bool {
        self.store.is_unique()
    }

    /// Snapshot the cursor so a caller holding the store across `Btree`
    /// instances (one per API call) can resume navigation.
    pub fn cursor_position(&self) -> Option<(LogicalId, usize)> {
        self.cursor.map(|c| (c.leaf, c.slot))
    }

    /// Restore a cursor previously taken with `cursor_position`.
    pub fn set_cursor_position(&mut self, position: Option<(LogicalId, usize)>) {
        self.cursor = position.map(|(leaf, slot)| Cursor { leaf, slot });
    }

    // ------------------------------------------------------------------
    // Search and cursor
    // ------------------------------------------------------------------

    /// Position the cursor at the first slot matching `key`, or the nearest
    /// slot when there is no match. Returns whether a match was found.
    /// An empty tree returns false with no cursor.
    pub fn find(&mut self, key: &Key) -> Result<bool> {
        self.find_pair(key, ItemId::nil(), false)
    }

    /// Like `find`, but demands the exact `(key, item_id)` slot. Useful to
    /// pick one item out of a run of duplicates.
    pub fn find_with_id(&mut self, key: &Key, id: ItemId) -> Result<bool> {
        self.find_pair(key, id, true)
    }

    fn find_pair(&mut self, key: &Key, id: ItemId, exact: bool) -> Result<bool> {
        if self.store.root().is_none() {
            self.cursor = None;
            return Ok(false);
        }
        let (_, leaf) = self.descend(key, id)?;
        let idx = self.lower_bound(&leaf, key, id);
        if idx < leaf.slots.len() {
            let slot = &leaf.slots[idx];
            let found = if exact {
                self.pair_equal(&slot.key, slot.item_id, key, id)
            } else {
                self.keys_equal(&slot.key, key)
            };
            self.cursor = Some(Cursor {
                leaf: leaf.node_id,
                slot: idx,
            });
            return Ok(found);
        }
        // Past the end of this leaf: the nearest (and possibly matching)
        // slot is the first of the next leaf. A duplicate run can start
        // exactly at a separator boundary.
        if let Some(next_id) = leaf.next_leaf {
            let next = self.store.read_node(next_id)?;
            let found = next
                .slots
                .first()
                .map(|slot| {
                    if exact {
                        self.pair_equal(&slot.key, slot.item_id, key, id)
                    } else {
                        self.keys_equal(&slot.key, key)
                    }
                })
                .unwrap_or(false);
            self.cursor = Some(Cursor {
                leaf: next_id,
                slot: 0,
            });
            return Ok(found);
        }
        // Nearest is the last slot of the tree.
        self.cursor = Some(Cursor {
            leaf: leaf.node_id,
            slot: leaf.slots.len().saturating_sub(1),
        });
        Ok(false)
    }

    /// Cursor to the smallest item. False on an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        let Some(mut id) = self.store.root() else {
            self.cursor = None;
            return Ok(false);
        };
        loop {
            let node = self.store.read_node(id)?;
            if node.is_leaf {
                self.cursor = Some(Cursor {
                    leaf: node.node_id,
                    slot: 0,
                });
                return Ok(true);
            }
            id = node.children[0];
        }
    }

    /// Cursor to the largest item. False on an empty tree.
    pub fn last(&mut self) -> Result<bool> {
        let Some(mut id) = self.store.root() else {
            self.cursor = None;
            return Ok(false);
        };
        loop {
            let node = self.store.read_node(id)?;
            if node.is_leaf {
                self.cursor = Some(Cursor {
                    leaf: node.node_id,
                    slot: node.slots.len().saturating_sub(1),
                });
                return Ok(true);
            }
            id = *node.children.last().expect("interior node has children");
        }
    }

    /// Advance the cursor one item. False (cursor unchanged) at the end.
    pub fn next(&mut self) -> Result<bool> {
        let Some(cursor) = self.cursor else {
            return Ok(false);
        };
        let leaf = self.store.read_node(cursor.leaf)?;
        if cursor.slot + 1 < leaf.slots.len() {
            self.cursor = Some(Cursor {
                leaf: cursor.leaf,
                slot: cursor.slot + 1,
            });
            return Ok(true);
        }
        if let Some(next_id) = leaf.next_leaf {
            self.cursor = Some(Cursor {
                leaf: next_id,
                slot: 0,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Step the cursor one item back. False (cursor unchanged) at the start.
    pub fn prev(&mut self) -> Result<bool> {
        let Some(cursor) = self.cursor else {
            return Ok(false);
        };
        if cursor.slot > 0 {
            self.cursor = Some(Cursor {
                leaf: cursor.leaf,
                slot: cursor.slot - 1,
            });
            return Ok(true);
        }
        let leaf = self.store.read_node(cursor.leaf)?;
        if let Some(prev_id) = leaf.prev_leaf {
            let prev = self.store.read_node(prev_id)?;
            self.cursor = Some(Cursor {
                leaf: prev_id,
                slot: prev.slots.len().saturating_sub(1),
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// The item under the cursor, without its value bytes.
    pub fn current_key(&mut self) -> Result<Option<Item>> {
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };
        let leaf = self.store.read_node(cursor.leaf)?;
        let Some(slot) = leaf.slots.get(cursor.slot) else {
            return Ok(None);
        };
        Ok(Some(Item {
            key: slot.key.clone(),
            value: Vec::new(),
            id: slot.item_id,
        }))
    }

    /// The item under the cursor, value included.
    pub fn current_item(&mut self) -> Result<Option<Item>> {
        let Some(cursor) = self.cursor else {
            return Ok(None);
        };
        let leaf = self.store.read_node(cursor.leaf)?;
        let Some(slot) = leaf.slots.get(cursor.slot) else {
            return Ok(None);
        };
        let slot = slot.clone();
        let value = self.store.read_value(&slot.value)?;
        Ok(Some(Item {
            key: slot.key,
            value,
            id: slot.item_id,
        }))
    }

    // ------------------------------------------------------------------
    // Bulk fetch
    // ------------------------------------------------------------------

    /// Page of keys (no value I/O) from the cursor.
    pub fn get_keys(&mut self, paging: PagingInfo) -> Result<Vec<Item>> {
        self.page(paging, false)
    }

    /// Page of full items from the cursor.
    pub fn get_items(&mut self, paging: PagingInfo) -> Result<Vec<Item>> {
        self.page(paging, true)
    }

    /// Batch value fetch: each probe carries a key (and optionally an item
    /// id, to disambiguate duplicates); the result carries the values.
    /// Fails on the first probe with no match, reporting its index.
    pub fn get_values(&mut self, probes: &[Item]) -> Result<Vec<Item>> {
        let mut out = Vec::with_capacity(probes.len());
        for (index, probe) in probes.iter().enumerate() {
            let found = if probe.id.is_nil() {
                self.find(&probe.key)?
            } else {
                self.find_with_id(&probe.key, probe.id)?
            };
            if !found {
                return Err(Error::not_found(format!(
                    "key {} (batch index {})",
                    probe.key, index
                )));
            }
            let item = self
                .current_item()?
                .ok_or_else(|| Error::internal("cursor vanished after find"))?;
            out.push(item);
        }
        Ok(out)
    }

    fn page(&mut self, paging: PagingInfo, with_values: bool) -> Result<Vec<Item>> {
        if self.cursor.is_none() {
            return Ok(Vec::new());
        }
        for _ in 0..paging.skip() {
            if !self.step(paging.direction)? {
                self.cursor = None;
                return Ok(Vec::new());
            }
        }
        let take = paging.take();
        let mut out = Vec::with_capacity(take.min(1024));
        while out.len() < take {
            let item = if with_values {
                self.current_item()?
            } else {
                self.current_key()?
            };
            let Some(item) = item else { break };
            out.push(item);
            if !self.step(paging.direction)? {
                // End of tree: the cursor is exhausted, so the next page
                // comes back empty instead of repeating the tail item.
                self.cursor = None;
                break;
            }
        }
        Ok(out)
    }

    fn step(&mut self, direction: PagingDirection) -> Result<bool> {
        match direction {
            PagingDirection::Forward => self.next(),
            PagingDirection::Backward => self.prev(),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Insert every item. In a unique store a pre-existing key fails the
    /// batch with `Duplicate` at the offending index; the store view is the
    /// caller's transaction, which is expected to roll back.
    pub fn add(&mut self, items: &[Item]) -> Result<()> {
        for (index, item) in items.iter().enumerate() {
            if self.store.is_unique() && self.key_exists(&item.key)? {
                return Err(Error::duplicate(index, format!("{}", item.key)));
            }
            self.insert_item(item)?;
        }
        self.cursor = None;
        Ok(())
    }

    /// Insert the items whose keys are absent; returns whether every item
    /// was inserted.
    pub fn add_if_not_exists(&mut self, items: &[Item]) -> Result<bool> {
        let mut all = true;
        for item in items {
            if self.key_exists(&item.key)? {
                all = false;
                continue;
            }
            self.insert_item(item)?;
        }
        self.cursor = None;
        Ok(all)
    }

    /// Replace values of existing items. A probe with a non-nil id targets
    /// that exact item; otherwise the first item with the key is updated.
    pub fn update(&mut self, items: &[Item]) -> Result<()> {
        for (index, item) in items.iter().enumerate() {
            if !self.update_one(item)? {
                return Err(Error::not_found(format!(
                    "key {} (batch index {})",
                    item.key, index
                )));
            }
        }
        self.cursor = None;
        Ok(())
    }

    /// Update when the key exists, insert when it does not.
    pub fn upsert(&mut self, items: &[Item]) -> Result<()> {
        for item in items {
            if self.update_one(item)? {
                continue;
            }
            // A unique store must never grow a second item for the key just
            // because the probe carried an unknown id.
            if self.store.is_unique() && !item.id.is_nil() && self.key_exists(&item.key)? {
                let mut by_key = item.clone();
                by_key.id = ItemId::nil();
                self.update_one(&by_key)?;
                continue;
            }
            self.insert_item(item)?;
        }
        self.cursor = None;
        Ok(())
    }

    /// Remove the first item matching each key. Returns false (leaving the
    /// earlier removals staged) as soon as a key has no match.
    pub fn remove(&mut self, keys: &[Key]) -> Result<bool> {
        for key in keys {
            if !self.remove_one(key)? {
                self.cursor = None;
                return Ok(false);
            }
        }
        self.cursor = None;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn keys_equal(&self, a: &Key, b: &Key) -> bool {
        self.store.comparator().compare(a, b) == Ordering::Equal
    }

    fn pair_equal(&self, a_key: &Key, a_id: ItemId, b_key: &Key, b_id: ItemId) -> bool {
        pair_cmp(self.store.comparator(), a_key, a_id, b_key, b_id) == Ordering::Equal
    }

    /// First slot index in `leaf` at or after the probe pair.
    fn lower_bound(&self, leaf: &Node, key: &Key, id: ItemId) -> usize {
        let comparator = self.store.comparator();
        leaf.slots
            .partition_point(|slot| {
                pair_cmp(comparator, &slot.key, slot.item_id, key, id) == Ordering::Less
            })
    }

    /// Walk from the root to the leaf owning the probe pair, recording the
    /// interior path as `(node, taken child index)`.
    #[allow(clippy::type_complexity)]
    fn descend(&mut self, key: &Key, id: ItemId) -> Result<(Vec<(Arc<Node>, usize)>, Arc<Node>)> {
        let root = self
            .store
            .root()
            .ok_or_else(|| Error::internal("descend into empty tree"))?;
        let mut node = self.store.read_node(root)?;
        let mut path = Vec::new();
        while !node.is_leaf {
            let comparator = self.store.comparator();
            // Child i covers pairs in [keys[i-1], keys[i]); go right on
            // separator equality because the right child starts at it.
            let idx = node.keys.partition_point(|sep| {
                pair_cmp(comparator, &sep.key, sep.item_id, key, id) != Ordering::Greater
            });
            let child = node.children[idx];
            path.push((Arc::clone(&node), idx));
            node = self.store.read_node(child)?;
        }
        Ok((path, node))
    }

    fn key_exists(&mut self, key: &Key) -> Result<bool> {
        if self.store.root().is_none() {
            return Ok(false);
        }
        let (_, leaf) = self.descend(key, ItemId::nil())?;
        let idx = self.lower_bound(&leaf, key, ItemId::nil());
        if let Some(slot) = leaf.slots.get(idx) {
            return Ok(self.keys_equal(&slot.key, key));
        }
        if let Some(next_id) = leaf.next_leaf {
            let next = self.store.read_node(next_id)?;
            if let Some(slot) = next.slots.first() {
                return Ok(self.keys_equal(&slot.key, key));
            }
        }
        Ok(false)
    }

    fn insert_item(&mut self, item: &Item) -> Result<()> {
        let id = if item.id.is_nil() {
            ItemId::new()
        } else {
            item.id
        };
        let value = self.store.write_value(&item.value)?;
        let slot = Slot {
            key: item.key.clone(),
            value,
            item_id: id,
            version: 1,
        };

        match self.store.root() {
            None => {
                let node_id = self.store.allocate_node_id();
                let mut leaf = Node::new_leaf(node_id);
                leaf.slots.push(slot);
                self.store.stage_node(leaf)?;
                self.store.set_root(Some(node_id))?;
            }
            Some(_) => {
                let (path, leaf) = self.descend(&item.key, id)?;
                let idx = self.lower_bound(&leaf, &item.key, id);
                let mut leaf = (*leaf).clone();
                leaf.slots.insert(idx, slot);
                if leaf.slots.len() <= self.store.slot_length() {
                    self.store.stage_node(leaf)?;
                } else if self.store.leaf_load_balancing()
                    && self.try_shift_to_sibling(&mut leaf, &path)?
                {
                    // Shifted one slot to an underfull neighbor; everything
                    // involved was staged by the shift.
                } else {
                    self.split_leaf(leaf, path)?;
                }
            }
        }
        self.store.set_item_count(self.store.item_count() + 1)
    }

    /// With leaf load balancing on, try to make room in an overfull leaf by
    /// shifting its edge slot into an adjacent same-parent sibling.
    fn try_shift_to_sibling(
        &mut self,
        leaf: &mut Node,
        path: &[(Arc<Node>, usize)],
    ) -> Result<bool> {
        let Some((parent, child_idx)) = path.last() else {
            return Ok(false);
        };
        let (parent, child_idx) = (Arc::clone(parent), *child_idx);
        let slot_length = self.store.slot_length();

        // Left neighbor takes our smallest slot.
        if child_idx > 0 {
            let left_id = parent.children[child_idx - 1];
            let left = self.store.read_node(left_id)?;
            if left.slots.len() < slot_length {
                let mut left = (*left).clone();
                let moved = leaf.slots.remove(0);
                left.slots.push(moved);
                let mut parent = (*parent).clone();
                let new_first = &leaf.slots[0];
                parent.keys[child_idx - 1] = Separator {
                    key: new_first.key.clone(),
                    item_id: new_first.item_id,
                };
                self.store.stage_node(left)?;
                self.store.stage_node(leaf.clone())?;
                self.store.stage_node(parent)?;
                return Ok(true);
            }
        }

        // Right neighbor takes our largest slot.
        if child_idx < parent.children.len() - 1 {
            let right_id = parent.children[child_idx + 1];
            let right = self.store.read_node(right_id)?;
            if right.slots.len() < slot_length {
                let mut right = (*right).clone();
                let moved = leaf.slots.pop().expect("overfull leaf has slots");
                let mut parent = (*parent).clone();
                parent.keys[child_idx] = Separator {
                    key: moved.key.clone(),
                    item_id: moved.item_id,
                };
                right.slots.insert(0, moved);
                self.store.stage_node(right)?;
                self.store.stage_node(leaf.clone())?;
                self.store.stage_node(parent)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn split_leaf(&mut self, mut leaf: Node, path: Vec<(Arc<Node>, usize)>) -> Result<()> {
        let mid = leaf.slots.len() / 2;
        let right_slots = leaf.slots.split_off(mid);
        let right_id = self.store.allocate_node_id();
        let mut right = Node::new_leaf(right_id);
        right.slots = right_slots;
        right.prev_leaf = Some(leaf.node_id);
        right.next_leaf = leaf.next_leaf;
        if let Some(old_next_id) = leaf.next_leaf {
            let mut old_next = (*self.store.read_node(old_next_id)?).clone();
            old_next.prev_leaf = Some(right_id);
            self.store.stage_node(old_next)?;
        }
        leaf.next_leaf = Some(right_id);

        let first = &right.slots[0];
        let separator = Separator {
            key: first.key.clone(),
            item_id: first.item_id,
        };
        let left_id = leaf.node_id;
        self.store.stage_node(leaf)?;
        self.store.stage_node(right)?;
        self.insert_into_parent(path, left_id, separator, right_id)
    }

    fn insert_into_parent(
        &mut self,
        mut path: Vec<(Arc<Node>, usize)>,
        left_id: LogicalId,
        separator: Separator,
        right_id: LogicalId,
    ) -> Result<()> {
        match path.pop() {
            None => {
                let root_id = self.store.allocate_node_id();
                let root = Node::new_interior(root_id, vec![separator], vec![left_id, right_id]);
                self.store.stage_node(root)?;
                self.store.set_root(Some(root_id))
            }
            Some((parent, child_idx)) => {
                let mut parent = (*parent).clone();
                parent.keys.insert(child_idx, separator);
                parent.children.insert(child_idx + 1, right_id);
                if parent.keys.len() <= self.store.slot_length() {
                    self.store.stage_node(parent)
                } else {
                    self.split_interior(parent, path)
                }
            }
        }
    }

    fn split_interior(&mut self, mut node: Node, path: Vec<(Arc<Node>, usize)>) -> Result<()> {
        let mid = node.keys.len() / 2;
        let mut right_keys = node.keys.split_off(mid);
        let up = right_keys.remove(0);
        let right_children = node.children.split_off(mid + 1);
        let right_id = self.store.allocate_node_id();
        let right = Node::new_interior(right_id, right_keys, right_children);
        let left_id = node.node_id;
        self.store.stage_node(node)?;
        self.store.stage_node(right)?;
        self.insert_into_parent(path, left_id, up, right_id)
    }

    fn update_one(&mut self, item: &Item) -> Result<bool> {
        if self.store.root().is_none() {
            return Ok(false);
        }
        // Resolve which exact item to touch first, then re-descend with the
        // full pair so the path matches the owning leaf.
        let target_id = if item.id.is_nil() {
            if !self.find(&item.key)? {
                return Ok(false);
            }
            match self.current_key()? {
                Some(found) => found.id,
                None => return Ok(false),
            }
        } else {
            item.id
        };
        let (_, leaf) = self.descend(&item.key, target_id)?;
        let idx = self.lower_bound(&leaf, &item.key, target_id);
        let Some(slot) = leaf.slots.get(idx) else {
            return Ok(false);
        };
        if !self.pair_equal(&slot.key, slot.item_id, &item.key, target_id) {
            return Ok(false);
        }
        let mut leaf = (*leaf).clone();
        let new_value = self.store.write_value(&item.value)?;
        let slot = &mut leaf.slots[idx];
        let old_value = std::mem::replace(&mut slot.value, new_value);
        slot.version += 1;
        self.store.stage_node(leaf)?;
        self.store.delete_value(&old_value)?;
        Ok(true)
    }

    fn remove_one(&mut self, key: &Key) -> Result<bool> {
        if self.store.root().is_none() {
            return Ok(false);
        }
        if !self.find(key)? {
            return Ok(false);
        }
        let target = match self.current_key()? {
            Some(found) => found,
            None => return Ok(false),
        };
        let (path, leaf) = self.descend(key, target.id)?;
        let idx = self.lower_bound(&leaf, key, target.id);
        let Some(slot) = leaf.slots.get(idx) else {
            return Err(Error::internal("located item vanished during remove"));
        };
        if !self.pair_equal(&slot.key, slot.item_id, key, target.id) {
            return Err(Error::internal("located item moved during remove"));
        }
        let mut leaf = (*leaf).clone();
        let removed = leaf.slots.remove(idx);
        self.store.delete_value(&removed.value)?;
        self.rebalance_leaf(leaf, path)?;
        self.store.set_item_count(self.store.item_count() - 1)?;
        Ok(true)
    }

    fn min_occupancy(&self) -> usize {
        self.store.slot_length() / 2
    }

    fn rebalance_leaf(&mut self, leaf: Node, mut path: Vec<(Arc<Node>, usize)>) -> Result<()> {
        let Some((parent, child_idx)) = path.pop() else {
            // Leaf root: shrink to empty tree when the last slot goes.
            if leaf.slots.is_empty() {
                self.store.delete_node(leaf.node_id)?;
                return self.store.set_root(None);
            }
            return self.store.stage_node(leaf);
        };
        if leaf.slots.len() >= self.min_occupancy() {
            return self.store.stage_node(leaf);
        }
        let mut parent_node = (*parent).clone();

        // Borrow from the left sibling when it has slack.
        if child_idx > 0 {
            let left_id = parent_node.children[child_idx - 1];
            let left = self.store.read_node(left_id)?;
            if left.slots.len() > self.min_occupancy() {
                let mut left = (*left).clone();
                let mut leaf = leaf;
                let moved = left.slots.pop().expect("sibling above minimum");
                parent_node.keys[child_idx - 1] = Separator {
                    key: moved.key.clone(),
                    item_id: moved.item_id,
                };
                leaf.slots.insert(0, moved);
                self.store.stage_node(left)?;
                self.store.stage_node(leaf)?;
                return self.stage_or_rebalance_interior(parent_node, path);
            }
        }

        // Borrow from the right sibling.
        if child_idx < parent_node.children.len() - 1 {
            let right_id = parent_node.children[child_idx + 1];
            let right = self.store.read_node(right_id)?;
            if right.slots.len() > self.min_occupancy() {
                let mut right = (*right).clone();
                let mut leaf = leaf;
                let moved = right.slots.remove(0);
                leaf.slots.push(moved);
                let new_first = &right.slots[0];
                parent_node.keys[child_idx] = Separator {
                    key: new_first.key.clone(),
                    item_id: new_first.item_id,
                };
                self.store.stage_node(right)?;
                self.store.stage_node(leaf)?;
                return self.stage_or_rebalance_interior(parent_node, path);
            }
        }

        // No slack anywhere: merge with a sibling.
        if child_idx > 0 {
            // Merge into the left sibling.
            let left_id = parent_node.children[child_idx - 1];
            let mut left = (*self.store.read_node(left_id)?).clone();
            left.slots.extend(leaf.slots);
            left.next_leaf = leaf.next_leaf;
            if let Some(next_id) = left.next_leaf {
                let mut next = (*self.store.read_node(next_id)?).clone();
                next.prev_leaf = Some(left_id);
                self.store.stage_node(next)?;
            }
            self.store.delete_node(leaf.node_id)?;
            parent_node.keys.remove(child_idx - 1);
            parent_node.children.remove(child_idx);
            self.store.stage_node(left)?;
        } else {
            // Merge the right sibling into this leaf.
            let right_id = parent_node.children[child_idx + 1];
            let right = self.store.read_node(right_id)?;
            let mut leaf = leaf;
            leaf.slots.extend(right.slots.iter().cloned());
            leaf.next_leaf = right.next_leaf;
            if let Some(next_id) = leaf.next_leaf {
                let mut next = (*self.store.read_node(next_id)?).clone();
                next.prev_leaf = Some(leaf.node_id);
                self.store.stage_node(next)?;
            }
            self.store.delete_node(right_id)?;
            parent_node.keys.remove(child_idx);
            parent_node.children.remove(child_idx + 1);
            self.store.stage_node(leaf)?;
        }
        self.rebalance_interior(parent_node, path)
    }

    fn stage_or_rebalance_interior(
        &mut self,
        node: Node,
        _path: Vec<(Arc<Node>, usize)>,
    ) -> Result<()> {
        // Separator rewrites never change the node's arity.
        self.store.stage_node(node)
    }

    fn rebalance_interior(&mut self, node: Node, mut path: Vec<(Arc<Node>, usize)>) -> Result<()> {
        let Some((parent, child_idx)) = path.pop() else {
            // Interior root collapses when it routes a single child.
            if node.keys.is_empty() {
                let only_child = node.children[0];
                self.store.delete_node(node.node_id)?;
                return self.store.set_root(Some(only_child));
            }
            return self.store.stage_node(node);
        };
        if node.keys.len() >= self.min_occupancy() {
            return self.store.stage_node(node);
        }
        let mut parent_node = (*parent).clone();

        // Rotate through the parent from the left sibling.
        if child_idx > 0 {
            let left_id = parent_node.children[child_idx - 1];
            let left = self.store.read_node(left_id)?;
            if left.keys.len() > self.min_occupancy() {
                let mut left = (*left).clone();
                let mut node = node;
                let down = parent_node.keys[child_idx - 1].clone();
                let up = left.keys.pop().expect("sibling above minimum");
                let child = left.children.pop().expect("interior node has children");
                parent_node.keys[child_idx - 1] = up;
                node.keys.insert(0, down);
                node.children.insert(0, child);
                self.store.stage_node(left)?;
                self.store.stage_node(node)?;
                return self.stage_or_rebalance_interior(parent_node, path);
            }
        }

        // Rotate from the right sibling.
        if child_idx < parent_node.children.len() - 1 {
            let right_id = parent_node.children[child_idx + 1];
            let right = self.store.read_node(right_id)?;
            if right.keys.len() > self.min_occupancy() {
                let mut right = (*right).clone();
                let mut node = node;
                let down = parent_node.keys[child_idx].clone();
                let up = right.keys.remove(0);
                let child = right.children.remove(0);
                parent_node.keys[child_idx] = up;
                node.keys.push(down);
                node.children.push(child);
                self.store.stage_node(right)?;
                self.store.stage_node(node)?;
                return self.stage_or_rebalance_interior(parent_node, path);
            }
        }

        // Merge interiors, pulling the split separator back down.
        if child_idx > 0 {
            let left_id = parent_node.children[child_idx - 1];
            let mut left = (*self.store.read_node(left_id)?).clone();
            let down = parent_node.keys.remove(child_idx - 1);
            parent_node.children.remove(child_idx);
            left.keys.push(down);
            left.keys.extend(node.keys);
            left.children.extend(node.children);
            self.store.delete_node(node.node_id)?;
            self.store.stage_node(left)?;
        } else {
            let right_id = parent_node.children[child_idx + 1];
            let right = self.store.read_node(right_id)?;
            let mut node = node;
            let down = parent_node.keys.remove(child_idx);
            parent_node.children.remove(child_idx + 1);
            node.keys.push(down);
            node.keys.extend(right.keys.iter().cloned());
            node.children.extend(right.children.iter().cloned());
            self.store.delete_node(right_id)?;
            self.store.stage_node(node)?;
        }
        self.rebalance_interior(parent_node, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryNodeStore;
    use sop_core::{IndexFieldSpecification, IndexSpecification, KeyComparator, ValuePlacement};

    fn items(pairs: &[(&str, &str)]) -> Vec<Item> {
        pairs.iter().map(|(k, v)| Item::new(*k, *v)).collect()
    }

    fn all_keys(store: &mut MemoryNodeStore) -> Vec<Key> {
        let mut tree = Btree::new(store);
        if !tree.first().unwrap() {
            return Vec::new();
        }
        tree.get_keys(PagingInfo::forward(1_000_000))
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect()
    }

    #[test]
    fn insert_and_traverse_sorted() {
        let mut store = MemoryNodeStore::new(4, false);
        {
            let mut tree = Btree::new(&mut store);
            let batch: Vec<Item> = (0..100)
                .map(|i| Item::new(format!("k{:03}", (i * 37) % 100), "v"))
                .collect();
            tree.add(&batch).unwrap();
            assert_eq!(tree.count(), 100);
        }
        store.check_invariants();
        let keys = all_keys(&mut store);
        assert_eq!(keys.len(), 100);
        let mut sorted = keys.clone();
        sorted.sort_by(|a, b| a.natural_cmp(b));
        assert_eq!(keys, sorted);
    }

    #[test]
    fn slot_length_two_forces_frequent_splits() {
        let mut store = MemoryNodeStore::new(2, true);
        {
            let mut tree = Btree::new(&mut store);
            for i in 0..50i64 {
                tree.add(&[Item::new(i, "v")]).unwrap();
            }
            assert_eq!(tree.count(), 50);
        }
        store.check_invariants();
        assert!(store.node_count() > 25, "tiny slots must split often");
        let keys = all_keys(&mut store);
        assert_eq!(keys, (0..50i64).map(Key::from).collect::<Vec<_>>());
    }

    #[test]
    fn unique_store_rejects_duplicate_with_batch_index() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&items(&[("a", "1"), ("b", "2")])).unwrap();
        let err = tree
            .add(&items(&[("c", "3"), ("b", "again")]))
            .unwrap_err();
        match err {
            Error::Duplicate { index, .. } => assert_eq!(index, 1),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn non_unique_store_orders_duplicates_by_item_id() {
        let mut store = MemoryNodeStore::new(4, false);
        let mut tree = Btree::new(&mut store);
        let mut dup_ids: Vec<ItemId> = Vec::new();
        for i in 0..6 {
            let item = Item::new("dup", format!("v{}", i)).with_id(ItemId::new());
            dup_ids.push(item.id);
            tree.add(&[item]).unwrap();
        }
        dup_ids.sort();

        assert!(tree.find(&Key::from("dup")).unwrap());
        let fetched = tree.get_keys(PagingInfo::forward(10)).unwrap();
        assert_eq!(fetched.len(), 6);
        let fetched_ids: Vec<ItemId> = fetched.iter().map(|i| i.id).collect();
        assert_eq!(fetched_ids, dup_ids, "duplicates iterate in id order");
    }

    #[test]
    fn find_with_id_picks_one_duplicate() {
        let mut store = MemoryNodeStore::new(4, false);
        let mut tree = Btree::new(&mut store);
        let a = Item::new("k", "first").with_id(ItemId::new());
        let b = Item::new("k", "second").with_id(ItemId::new());
        let b_id = b.id;
        tree.add(&[a, b]).unwrap();

        assert!(tree.find_with_id(&Key::from("k"), b_id).unwrap());
        let current = tree.current_item().unwrap().unwrap();
        assert_eq!(current.id, b_id);
        assert_eq!(current.value, b"second".to_vec());
        assert!(!tree.find_with_id(&Key::from("k"), ItemId::new()).unwrap());
    }

    #[test]
    fn find_positions_at_nearest_on_miss() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&items(&[("b", "1"), ("d", "2"), ("f", "3")]))
            .unwrap();
        assert!(!tree.find(&Key::from("c")).unwrap());
        let near = tree.current_key().unwrap().unwrap();
        assert_eq!(near.key, Key::from("d"));
        // Past the last key: nearest is the tail item.
        assert!(!tree.find(&Key::from("zzz")).unwrap());
        let near = tree.current_key().unwrap().unwrap();
        assert_eq!(near.key, Key::from("f"));
    }

    #[test]
    fn empty_tree_behaviors() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        assert!(!tree.find(&Key::from("x")).unwrap());
        assert!(!tree.first().unwrap());
        assert!(!tree.last().unwrap());
        assert_eq!(tree.count(), 0);
        assert!(tree.get_items(PagingInfo::default()).unwrap().is_empty());
        assert!(!tree.remove(&[Key::from("x")]).unwrap());
    }

    #[test]
    fn add_then_remove_leaves_empty_tree() {
        let mut store = MemoryNodeStore::new(4, true);
        {
            let mut tree = Btree::new(&mut store);
            tree.add(&items(&[("only", "v")])).unwrap();
            assert!(tree.remove(&[Key::from("only")]).unwrap());
            assert_eq!(tree.count(), 0);
            assert!(!tree.first().unwrap());
        }
        store.check_invariants();
        assert_eq!(store.node_count(), 0, "empty tree holds no nodes");
    }

    #[test]
    fn removal_merges_keep_invariants() {
        let mut store = MemoryNodeStore::new(4, true);
        {
            let mut tree = Btree::new(&mut store);
            let batch: Vec<Item> = (0..200i64).map(|i| Item::new(i, "v")).collect();
            tree.add(&batch).unwrap();
            // Remove from the middle out to force merges at every level.
            for i in 50..150i64 {
                assert!(tree.remove(&[Key::from(i)]).unwrap(), "missing {i}");
            }
            assert_eq!(tree.count(), 100);
        }
        store.check_invariants();
        let keys = all_keys(&mut store);
        let expected: Vec<Key> = (0..50i64).chain(150..200).map(Key::from).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn update_replaces_value_and_bumps_version() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&items(&[("k", "old")])).unwrap();
        tree.update(&[Item {
            key: Key::from("k"),
            value: b"new".to_vec(),
            id: ItemId::nil(),
        }])
        .unwrap();
        assert!(tree.find(&Key::from("k")).unwrap());
        assert_eq!(tree.current_item().unwrap().unwrap().value, b"new".to_vec());

        let err = tree
            .update(&[Item::new("absent", "v")])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.upsert(&items(&[("k", "v1")])).unwrap();
        tree.upsert(&items(&[("k", "v2")])).unwrap();
        tree.upsert(&items(&[("k", "v2")])).unwrap();
        assert_eq!(tree.count(), 1);
        assert!(tree.find(&Key::from("k")).unwrap());
        assert_eq!(tree.current_item().unwrap().unwrap().value, b"v2".to_vec());
    }

    #[test]
    fn add_if_not_exists_reports_partial() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        assert!(tree.add_if_not_exists(&items(&[("a", "1")])).unwrap());
        assert!(!tree
            .add_if_not_exists(&items(&[("a", "dup"), ("b", "2")]))
            .unwrap());
        // "b" still made it in.
        assert_eq!(tree.count(), 2);
        assert!(tree.find(&Key::from("b")).unwrap());
    }

    #[test]
    fn paging_forward_concatenates_without_gaps() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        let batch: Vec<Item> = (0..57i64).map(|i| Item::new(i, "v")).collect();
        tree.add(&batch).unwrap();

        assert!(tree.first().unwrap());
        let mut seen = Vec::new();
        loop {
            let page = tree.get_keys(PagingInfo::forward(10)).unwrap();
            if page.is_empty() {
                break;
            }
            seen.extend(page.into_iter().map(|i| i.key));
        }
        assert_eq!(seen, (0..57i64).map(Key::from).collect::<Vec<_>>());
    }

    #[test]
    fn paging_backward_from_last() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&(0..10i64).map(|i| Item::new(i, "v")).collect::<Vec<_>>())
            .unwrap();
        assert!(tree.last().unwrap());
        let page = tree.get_keys(PagingInfo::backward(4)).unwrap();
        let keys: Vec<Key> = page.into_iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![Key::from(9i64), 8.into(), 7.into(), 6.into()]);
    }

    #[test]
    fn paging_offset_past_end_is_short_not_error() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&(0..5i64).map(|i| Item::new(i, "v")).collect::<Vec<_>>())
            .unwrap();
        assert!(tree.first().unwrap());
        let mut paging = PagingInfo::forward(10);
        paging.page_offset = 7;
        assert!(tree.get_keys(paging).unwrap().is_empty());
    }

    #[test]
    fn fetch_count_caps_page() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&(0..20i64).map(|i| Item::new(i, "v")).collect::<Vec<_>>())
            .unwrap();
        assert!(tree.first().unwrap());
        let mut paging = PagingInfo::forward(10);
        paging.fetch_count = 3;
        assert_eq!(tree.get_keys(paging).unwrap().len(), 3);
    }

    #[test]
    fn get_values_resolves_batch_and_reports_missing_index() {
        let mut store = MemoryNodeStore::new(4, true);
        let mut tree = Btree::new(&mut store);
        tree.add(&items(&[("u1", "A"), ("u2", "B")])).unwrap();

        let got = tree
            .get_values(&[Item::probe("u1"), Item::probe("u2")])
            .unwrap();
        assert_eq!(got[0].value, b"A".to_vec());
        assert_eq!(got[1].value, b"B".to_vec());

        let err = tree
            .get_values(&[Item::probe("u1"), Item::probe("nope")])
            .unwrap_err();
        assert!(err.to_string().contains("index 1"));
    }

    #[test]
    fn leaf_load_balancing_shifts_before_splitting() {
        let mut plain = MemoryNodeStore::new(4, true);
        {
            let mut tree = Btree::new(&mut plain);
            for i in 0..32i64 {
                tree.add(&[Item::new(i, "v")]).unwrap();
            }
        }
        let mut balanced = MemoryNodeStore::new(4, true).with_load_balancing();
        {
            let mut tree = Btree::new(&mut balanced);
            for i in 0..32i64 {
                tree.add(&[Item::new(i, "v")]).unwrap();
            }
        }
        plain.check_invariants();
        balanced.check_invariants();
        assert_eq!(all_keys(&mut balanced).len(), 32);
        assert!(
            balanced.node_count() <= plain.node_count(),
            "balancing must not create more nodes than plain splitting"
        );
    }

    #[test]
    fn separate_placement_values_follow_item_lifecycle() {
        let mut store =
            MemoryNodeStore::new(4, true).with_placement(ValuePlacement::SeparateCached);
        let mut tree = Btree::new(&mut store);
        tree.add(&items(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(tree.store.separate_value_count(), 2);

        tree.update(&[Item::new("a", "1x")]).unwrap();
        assert_eq!(tree.store.separate_value_count(), 2, "old blob released");

        assert!(tree.find(&Key::from("a")).unwrap());
        assert_eq!(tree.current_item().unwrap().unwrap().value, b"1x".to_vec());

        assert!(tree.remove(&[Key::from("a"), Key::from("b")]).unwrap());
        assert_eq!(tree.store.separate_value_count(), 0);
    }

    #[test]
    fn composite_index_spec_orders_employees() {
        let spec = IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("region"),
            IndexFieldSpecification::ascending("department"),
            IndexFieldSpecification::ascending("employee_id"),
        ]);
        let mut store =
            MemoryNodeStore::new(4, true).with_comparator(KeyComparator::with_index(spec));
        let mut tree = Btree::new(&mut store);
        let employees = [
            ("US", "Eng", 101i64),
            ("US", "Sales", 202),
            ("EU", "Eng", 102),
        ];
        for (region, dept, id) in employees {
            let key = Key::composite([
                ("region", sop_core::FieldValue::from(region)),
                ("department", dept.into()),
                ("employee_id", id.into()),
            ]);
            tree.add(&[Item {
                key,
                value: b"emp".to_vec(),
                id: ItemId::new(),
            }])
            .unwrap();
        }
        assert!(tree.first().unwrap());
        let keys: Vec<Key> = tree
            .get_keys(PagingInfo::forward(10))
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect();
        let regions: Vec<&sop_core::FieldValue> =
            keys.iter().map(|k| k.field("region").unwrap()).collect();
        assert_eq!(
            regions,
            vec![
                &sop_core::FieldValue::from("EU"),
                &sop_core::FieldValue::from("US"),
                &sop_core::FieldValue::from("US"),
            ]
        );
        let ids: Vec<i64> = keys
            .iter()
            .map(|k| match k.field("employee_id").unwrap() {
                sop_core::FieldValue::Integer(i) => *i,
                other => panic!("unexpected field {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![102, 101, 202]);
    }

    mod model {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        #[derive(Debug, Clone)]
        enum Op {
            Add(u8),
            Remove(u8),
            Upsert(u8),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                any::<u8>().prop_map(Op::Add),
                any::<u8>().prop_map(Op::Remove),
                any::<u8>().prop_map(Op::Upsert),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn matches_reference_map(ops in proptest::collection::vec(op_strategy(), 1..200)) {
                let mut store = MemoryNodeStore::new(4, true);
                let mut reference: BTreeMap<i64, Vec<u8>> = BTreeMap::new();
                {
                    let mut tree = Btree::new(&mut store);
                    for (step, op) in ops.iter().enumerate() {
                        match op {
                            Op::Add(k) => {
                                let key = i64::from(*k);
                                let value = format!("v{step}").into_bytes();
                                let result = tree.add(&[Item {
                                    key: key.into(),
                                    value: value.clone(),
                                    id: ItemId::new(),
                                }]);
                                if reference.contains_key(&key) {
                                    prop_assert!(result.is_err());
                                } else {
                                    prop_assert!(result.is_ok());
                                    reference.insert(key, value);
                                }
                            }
                            Op::Remove(k) => {
                                let key = i64::from(*k);
                                let removed = tree.remove(&[Key::from(key)]).unwrap();
                                prop_assert_eq!(removed, reference.remove(&key).is_some());
                            }
                            Op::Upsert(k) => {
                                let key = i64::from(*k);
                                let value = format!("u{step}").into_bytes();
                                tree.upsert(&[Item {
                                    key: key.into(),
                                    value: value.clone(),
                                    id: ItemId::new(),
                                }]).unwrap();
                                reference.insert(key, value);
                            }
                        }
                    }
                    prop_assert_eq!(tree.count(), reference.len() as u64);
                }
                store.check_invariants();

                let keys = {
                    let mut tree = Btree::new(&mut store);
                    if tree.first().unwrap() {
                        tree.get_keys(PagingInfo::forward(1000)).unwrap()
                    } else {
                        Vec::new()
                    }
                };
                let expected: Vec<Key> = reference.keys().map(|k| Key::from(*k)).collect();
                let actual: Vec<Key> = keys.into_iter().map(|i| i.key).collect();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
