//! User-facing store handle, bound to one transaction.
//!
//! Every call re-creates a `Btree` over the transaction's store view and
//! restores the cursor saved by the previous call, so `find` followed by
//! `get_items` pages from the match the way callers expect. A handle whose
//! transaction has committed, rolled back or timed out fails every
//! operation with `InvalidState`.

use crate::database::TxCell;
use parking_lot::Mutex;
use sop_btree::{Btree, Item, PagingInfo};
use sop_concurrency::StoreView;
use sop_core::{Context, Error, ItemId, Key, LogicalId, Result, StoreInfo};
use std::sync::Arc;

pub struct BtreeStore {
    cell: Arc<Mutex<TxCell>>,
    slot: usize,
    name: String,
    cursor: Mutex<Option<(LogicalId, usize)>>,
}

impl BtreeStore {
    pub(crate) fn bind(cell: Arc<Mutex<TxCell>>, slot: usize, name: String) -> Self {
        BtreeStore {
            cell,
            slot,
            name,
            cursor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's metadata as staged in this transaction.
    pub fn store_info(&self) -> StoreInfo {
        self.cell.lock().tx.store_info(self.slot).clone()
    }

    fn with_tree<R>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&mut Btree<'_, StoreView<'_>>) -> Result<R>,
    ) -> Result<R> {
        ctx.check()?;
        let mut cell = self.cell.lock();
        cell.tx.ensure_active()?;
        let mut cursor = self.cursor.lock();
        let mut view = cell.tx.store_view(self.slot);
        let mut tree = Btree::new(&mut view);
        tree.set_cursor_position(*cursor);
        let result = f(&mut tree);
        *cursor = tree.cursor_position();
        result
    }

    // --- lookup & navigation -----------------------------------------

    /// Position the cursor at the first matching item (or its nearest
    /// neighbor); true when a match exists.
    pub fn find(&self, ctx: &Context, key: &Key) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.find(key))
    }

    /// Position the cursor at the exact `(key, item id)` slot; fails with
    /// `NotFound` when no such item exists.
    pub fn find_with_id(&self, ctx: &Context, key: &Key, id: ItemId) -> Result<()> {
        self.with_tree(ctx, |tree| {
            if tree.find_with_id(key, id)? {
                Ok(())
            } else {
                Err(Error::not_found(format!("key {} with id {}", key, id)))
            }
        })
    }

    pub fn first(&self, ctx: &Context) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.first())
    }

    pub fn last(&self, ctx: &Context) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.last())
    }

    pub fn next(&self, ctx: &Context) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.next())
    }

    pub fn prev(&self, ctx: &Context) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.prev())
    }

    /// The item under the cursor, value included.
    pub fn current_item(&self, ctx: &Context) -> Result<Option<Item>> {
        self.with_tree(ctx, |tree| tree.current_item())
    }

    // --- bulk fetch ---------------------------------------------------

    pub fn get_keys(&self, ctx: &Context, paging: PagingInfo) -> Result<Vec<Item>> {
        self.with_tree(ctx, |tree| tree.get_keys(paging))
    }

    pub fn get_items(&self, ctx: &Context, paging: PagingInfo) -> Result<Vec<Item>> {
        self.with_tree(ctx, |tree| tree.get_items(paging))
    }

    /// Fetch values for the probed keys (optionally pinned by item id).
    pub fn get_values(&self, ctx: &Context, probes: &[Item]) -> Result<Vec<Item>> {
        self.with_tree(ctx, |tree| tree.get_values(probes))
    }

    // --- mutation -----------------------------------------------------

    pub fn add(&self, ctx: &Context, items: &[Item]) -> Result<()> {
        self.with_tree(ctx, |tree| tree.add(items))
    }

    pub fn add_if_not_exists(&self, ctx: &Context, items: &[Item]) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.add_if_not_exists(items))
    }

    pub fn update(&self, ctx: &Context, items: &[Item]) -> Result<()> {
        self.with_tree(ctx, |tree| tree.update(items))
    }

    pub fn upsert(&self, ctx: &Context, items: &[Item]) -> Result<()> {
        self.with_tree(ctx, |tree| tree.upsert(items))
    }

    pub fn remove(&self, ctx: &Context, keys: &[Key]) -> Result<bool> {
        self.with_tree(ctx, |tree| tree.remove(keys))
    }

    // --- metadata -----------------------------------------------------

    pub fn count(&self) -> Result<u64> {
        let cell = self.cell.lock();
        Ok(cell.tx.store_info(self.slot).item_count)
    }

    pub fn is_unique(&self) -> Result<bool> {
        let cell = self.cell.lock();
        Ok(cell.tx.store_info(self.slot).is_unique)
    }
}
