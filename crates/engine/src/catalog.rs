//! Store catalog: names to store records, itself a B-tree.
//!
//! The catalog is an ordinary unique store keyed by store name whose
//! identity is hard-coded, which breaks the otherwise circular "look up the
//! catalog in the catalog" dependency: bootstrap reads the catalog's
//! metadata record straight from its well-known registry entry. Until the
//! first store is created that entry simply does not exist and the catalog
//! reads as empty.
//!
//! A catalog record carries only the store uuid; the store's structural
//! description lives in its own metadata record, addressed by that uuid and
//! updated transactionally with the store's data.

use crate::database::{Database, DbTransaction, TxCell};
use crate::store::BtreeStore;
use serde::{Deserialize, Serialize};
use sop_btree::{Item, NodeStore, PagingInfo, ValueRef};
use sop_concurrency::store_info_logical_id;
use sop_core::{
    CacheConfig, ComparatorExpression, Context, Error, IndexSpecification, Key, KeyKind, Result,
    SegmentId, StoreId, StoreInfo, StoreOptions,
};
use sop_storage::{CacheClass, CachedValue};
use tracing::{debug, info};

/// Reserved name of the catalog store.
pub const CATALOG_STORE_NAME: &str = "__catalog__";

/// Well-known identity of the catalog store; must never change once a
/// database holds data.
fn catalog_store_id() -> StoreId {
    StoreId::from_bytes(*b"sop/catalog/root")
}

/// One catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogRecord {
    store_uuid: StoreId,
}

impl Database {
    fn catalog_info(&self) -> StoreInfo {
        StoreInfo {
            database_id: self.id(),
            store_name: CATALOG_STORE_NAME.to_string(),
            store_uuid: catalog_store_id(),
            description: "store catalog".to_string(),
            key_kind: KeyKind::Primitive,
            index_spec: None,
            cel_expression: None,
            slot_length: 50,
            is_unique: true,
            value_placement: sop_core::ValuePlacement::InNode,
            leaf_load_balancing: false,
            cache_config: CacheConfig::default(),
            item_count: 0,
            root_node: None,
            version: 0,
        }
    }

    /// Load a store's metadata record through the cache, pinned to the
    /// registry's current version. The record lives in the same blob
    /// backend as the store's data, so resolution goes by store name.
    fn load_store_info(
        &self,
        ctx: &Context,
        store_name: &str,
        uuid: StoreId,
    ) -> Result<(StoreInfo, u64, SegmentId)> {
        let logical = store_info_logical_id(uuid);
        let entry = self.registry.lookup(ctx, &[logical])?[0]
            .ok_or_else(|| Error::not_found(format!("store record {}", uuid)))?;
        let key = uuid.to_string();
        if let Some(hit) = self.cache.get(CacheClass::StoreInfo, &key, entry.version)? {
            let info: StoreInfo = serde_json::from_slice(&hit.bytes)?;
            return Ok((info, entry.version, entry.segment_id));
        }
        let bytes = self.blobs_for(store_name).read(ctx, entry.segment_id)?;
        let info: StoreInfo = serde_json::from_slice(&bytes)?;
        self.cache.put(
            CacheClass::StoreInfo,
            &key,
            CachedValue::new(entry.version, bytes),
            info.cache_config.store_info_ttl(),
            info.cache_config.is_store_info_cache_ttl,
            true,
        )?;
        Ok((info, entry.version, entry.segment_id))
    }

    /// Attach the catalog for reading. `None` when the database has no
    /// catalog yet (no store was ever created).
    fn catalog_read_slot(&self, ctx: &Context, cell: &mut TxCell) -> Result<Option<usize>> {
        if let Some(slot) = cell.attached.get(CATALOG_STORE_NAME) {
            return Ok(Some(*slot));
        }
        let logical = store_info_logical_id(catalog_store_id());
        if self.registry.lookup(ctx, &[logical])?[0].is_none() {
            return Ok(None);
        }
        let (info, version, segment) =
            self.load_store_info(ctx, CATALOG_STORE_NAME, catalog_store_id())?;
        let slot = cell.tx.attach_store(
            info,
            version,
            Some(segment),
            self.blobs_for(CATALOG_STORE_NAME),
        )?;
        cell.attached.insert(CATALOG_STORE_NAME.to_string(), slot);
        Ok(Some(slot))
    }

    /// Attach the catalog for writing, creating its metadata on first use.
    fn catalog_write_slot(&self, ctx: &Context, cell: &mut TxCell) -> Result<usize> {
        if let Some(slot) = self.catalog_read_slot(ctx, cell)? {
            return Ok(slot);
        }
        let slot = cell.tx.attach_store(
            self.catalog_info(),
            0,
            None,
            self.blobs_for(CATALOG_STORE_NAME),
        )?;
        cell.attached.insert(CATALOG_STORE_NAME.to_string(), slot);
        debug!("catalog store bootstrapped");
        Ok(slot)
    }

    /// Create a new store and hand back a handle bound to `tx`.
    pub fn new_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
        options: StoreOptions,
        index_spec: Option<IndexSpecification>,
    ) -> Result<BtreeStore> {
        ctx.check()?;
        if name.is_empty() || name.starts_with("__") {
            return Err(Error::invalid_config(format!(
                "store name {:?} is empty or reserved",
                name
            )));
        }
        let placement = options.value_placement()?;
        if let Some(spec) = &index_spec {
            spec.validate()?;
        }
        let cel_expression = if options.cel_expression.is_empty() {
            None
        } else {
            // Refuse to persist an expression that will not parse.
            ComparatorExpression::parse(&options.cel_expression)?;
            Some(options.cel_expression.clone())
        };
        let key_kind = if index_spec.is_some() || !options.is_primitive_key {
            KeyKind::Composite
        } else {
            KeyKind::Primitive
        };

        let mut cell = tx.cell.lock();
        let catalog_slot = self.catalog_write_slot(ctx, &mut cell)?;
        {
            let mut view = cell.tx.store_view(catalog_slot);
            let mut catalog = sop_btree::Btree::new(&mut view);
            if catalog.find(&Key::from(name))? {
                return Err(Error::precondition_failed(format!(
                    "store {:?} already exists",
                    name
                )));
            }
        }

        let info = StoreInfo {
            database_id: self.id(),
            store_name: name.to_string(),
            store_uuid: StoreId::new(),
            description: options.description.clone(),
            key_kind,
            index_spec,
            cel_expression,
            slot_length: options.effective_slot_length(),
            is_unique: options.is_unique,
            value_placement: placement,
            leaf_load_balancing: options.leaf_load_balancing,
            cache_config: options.cache_config.clone(),
            item_count: 0,
            root_node: None,
            version: 0,
        };
        let record = CatalogRecord {
            store_uuid: info.store_uuid,
        };
        {
            let mut view = cell.tx.store_view(catalog_slot);
            let mut catalog = sop_btree::Btree::new(&mut view);
            catalog.add(&[Item {
                key: Key::from(name),
                value: serde_json::to_vec(&record)?,
                id: sop_core::ItemId::nil(),
            }])?;
        }

        let slot = cell
            .tx
            .attach_store(info, 0, None, self.blobs_for(name))?;
        cell.attached.insert(name.to_string(), slot);
        info!(store = name, "store created");
        Ok(BtreeStore::bind(tx.cell.clone(), slot, name.to_string()))
    }

    /// Open an existing store in `tx`.
    pub fn open_store(&self, ctx: &Context, tx: &DbTransaction, name: &str) -> Result<BtreeStore> {
        ctx.check()?;
        let mut cell = tx.cell.lock();
        if let Some(slot) = cell.attached.get(name) {
            return Ok(BtreeStore::bind(tx.cell.clone(), *slot, name.to_string()));
        }
        let record = self.lookup_catalog_record(ctx, &mut cell, name)?;
        let (info, version, segment) = self.load_store_info(ctx, name, record.store_uuid)?;
        let slot = cell
            .tx
            .attach_store(info, version, Some(segment), self.blobs_for(name))?;
        cell.attached.insert(name.to_string(), slot);
        Ok(BtreeStore::bind(tx.cell.clone(), slot, name.to_string()))
    }

    fn lookup_catalog_record(
        &self,
        ctx: &Context,
        cell: &mut TxCell,
        name: &str,
    ) -> Result<CatalogRecord> {
        let Some(catalog_slot) = self.catalog_read_slot(ctx, cell)? else {
            return Err(Error::not_found(format!("store {:?}", name)));
        };
        let mut view = cell.tx.store_view(catalog_slot);
        let mut catalog = sop_btree::Btree::new(&mut view);
        if !catalog.find(&Key::from(name))? {
            return Err(Error::not_found(format!("store {:?}", name)));
        }
        let item = catalog
            .current_item()?
            .ok_or_else(|| Error::internal("catalog cursor vanished"))?;
        Ok(serde_json::from_slice(&item.value)?)
    }

    /// Reconfigure an existing store. Structural fields (`slot_length`,
    /// `is_unique`, key kind, value placement, the index spec) may only
    /// change while the store is empty; the comparator expression only
    /// while no index spec exists or the store is empty. Description,
    /// cache policy and leaf load balancing may always change.
    pub fn update_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
        options: StoreOptions,
        index_spec: Option<IndexSpecification>,
    ) -> Result<()> {
        let store = self.open_store(ctx, tx, name)?;
        let current = store.store_info();

        if let Some(spec) = &index_spec {
            spec.validate()?;
        }
        let cel_expression = if options.cel_expression.is_empty() {
            None
        } else {
            ComparatorExpression::parse(&options.cel_expression)?;
            Some(options.cel_expression.clone())
        };
        let key_kind = if index_spec.is_some() || !options.is_primitive_key {
            KeyKind::Composite
        } else {
            KeyKind::Primitive
        };
        let candidate = StoreInfo {
            description: options.description.clone(),
            key_kind,
            index_spec,
            cel_expression,
            slot_length: options.effective_slot_length(),
            is_unique: options.is_unique,
            value_placement: options.value_placement()?,
            leaf_load_balancing: options.leaf_load_balancing,
            cache_config: options.cache_config.clone(),
            ..current.clone()
        };
        current.ensure_structural_match(&candidate)?;
        current.ensure_expression_change_allowed(candidate.cel_expression.as_deref())?;

        let mut cell = tx.cell.lock();
        let slot = *cell
            .attached
            .get(name)
            .ok_or_else(|| Error::internal("store detached during update"))?;
        cell.tx.replace_store_info(slot, candidate)?;
        info!(store = name, "store reconfigured");
        Ok(())
    }

    /// Drop a store: its catalog row, metadata record, every node entry and
    /// all value blobs. The space is reclaimed after the retention window.
    pub fn remove_store(&self, ctx: &Context, tx: &DbTransaction, name: &str) -> Result<()> {
        ctx.check()?;
        if name.starts_with("__") {
            return Err(Error::invalid_config(format!(
                "store name {:?} is reserved",
                name
            )));
        }
        let mut cell = tx.cell.lock();
        let record = self.lookup_catalog_record(ctx, &mut cell, name)?;
        let (info, version, segment) = self.load_store_info(ctx, name, record.store_uuid)?;
        let store_uuid = info.store_uuid;
        let root = info.root_node.map(|h| h.logical_id);
        let slot = match cell.attached.get(name) {
            Some(slot) => *slot,
            None => {
                let slot =
                    cell.tx
                        .attach_store(info, version, Some(segment), self.blobs_for(name))?;
                cell.attached.insert(name.to_string(), slot);
                slot
            }
        };

        // Tear the tree down bottom-up: values first, then every node.
        let mut view = cell.tx.store_view(slot);
        if let Some(root) = root {
            let mut stack = vec![root];
            let mut all_nodes = Vec::new();
            while let Some(id) = stack.pop() {
                let node = view.read_node(id)?;
                if node.is_leaf {
                    for slot_entry in &node.slots {
                        if matches!(slot_entry.value, ValueRef::Blob(_)) {
                            view.delete_value(&slot_entry.value)?;
                        }
                    }
                } else {
                    stack.extend(node.children.iter().copied());
                }
                all_nodes.push(id);
            }
            for id in all_nodes {
                view.delete_node(id)?;
            }
        }
        // The metadata record dies with the data.
        view.delete_node(store_info_logical_id(store_uuid))?;
        drop(view);

        let catalog_slot = self
            .catalog_read_slot(ctx, &mut cell)?
            .ok_or_else(|| Error::internal("catalog vanished during remove_store"))?;
        let mut view = cell.tx.store_view(catalog_slot);
        let mut catalog = sop_btree::Btree::new(&mut view);
        if !catalog.remove(&[Key::from(name)])? {
            return Err(Error::internal("catalog row vanished during remove_store"));
        }
        drop(view);

        cell.attached.remove(name);
        self.cache
            .invalidate(CacheClass::StoreInfo, &store_uuid.to_string())?;
        info!(store = name, "store removed");
        Ok(())
    }

    /// All store names, in order. The browsing surface for admin tooling.
    pub fn store_names(&self, ctx: &Context, tx: &DbTransaction) -> Result<Vec<String>> {
        ctx.check()?;
        let mut cell = tx.cell.lock();
        let Some(catalog_slot) = self.catalog_read_slot(ctx, &mut cell)? else {
            return Ok(Vec::new());
        };
        let mut view = cell.tx.store_view(catalog_slot);
        let mut catalog = sop_btree::Btree::new(&mut view);
        let mut names = Vec::new();
        if !catalog.first()? {
            return Ok(names);
        }
        loop {
            let page = catalog.get_keys(PagingInfo::forward(64))?;
            if page.is_empty() {
                break;
            }
            for item in page {
                if let Key::String(name) = item.key {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use sop_core::{DatabaseOptions, TransactionOptions};
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new();
        let db = Database::create(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();
        (dir, db)
    }

    #[test]
    fn setup_get_options_round_trip() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new();
        let effective =
            Database::setup(&ctx, DatabaseOptions::standalone(dir.path())).unwrap();
        let read_back = Database::get_options(dir.path()).unwrap();
        assert_eq!(effective, read_back);
        assert!(read_back.database_id.is_some());
        assert_eq!(read_back.registry_hash_mod, 250);
    }

    #[test]
    fn store_lifecycle_across_transactions() {
        let (_dir, db) = open_db();
        let ctx = Context::new();

        let tx1 = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        let users = db
            .new_store(&ctx, &tx1, "users", StoreOptions::default(), None)
            .unwrap();
        users
            .add(&ctx, &[sop_btree::Item::new("u1", "A")])
            .unwrap();
        tx1.commit(&ctx).unwrap();

        let tx2 = db
            .begin_transaction(&ctx, TransactionOptions::reading())
            .unwrap();
        let users = db.open_store(&ctx, &tx2, "users").unwrap();
        assert!(users.find(&ctx, &Key::from("u1")).unwrap());
        let got = users
            .get_values(&ctx, &[sop_btree::Item::probe("u1")])
            .unwrap();
        assert_eq!(got[0].value, b"A".to_vec());
        assert_eq!(users.count().unwrap(), 1);
        tx2.commit(&ctx).unwrap();
    }

    #[test]
    fn store_handle_dies_with_its_transaction() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        let store = db
            .new_store(&ctx, &tx, "shortlived", StoreOptions::default(), None)
            .unwrap();
        store.add(&ctx, &[sop_btree::Item::new("k", "v")]).unwrap();
        tx.commit(&ctx).unwrap();
        assert!(matches!(
            store.find(&ctx, &Key::from("k")),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn duplicate_store_name_is_refused() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        db.new_store(&ctx, &tx, "twice", StoreOptions::default(), None)
            .unwrap();
        let err = db
            .new_store(&ctx, &tx, "twice", StoreOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[test]
    fn reserved_names_are_refused() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        assert!(db
            .new_store(&ctx, &tx, "__catalog__", StoreOptions::default(), None)
            .is_err());
        assert!(db.new_store(&ctx, &tx, "", StoreOptions::default(), None).is_err());
        assert!(db.remove_store(&ctx, &tx, "__catalog__").is_err());
    }

    #[test]
    fn open_missing_store_is_not_found() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::reading()).unwrap();
        assert!(matches!(
            db.open_store(&ctx, &tx, "ghost"),
            Err(Error::NotFound { .. })
        ));
        assert!(db.store_names(&ctx, &tx).unwrap().is_empty());
    }

    #[test]
    fn store_names_lists_in_order_without_catalog() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        for name in ["zebra", "alpha", "middle"] {
            db.new_store(&ctx, &tx, name, StoreOptions::default(), None)
                .unwrap();
        }
        tx.commit(&ctx).unwrap();

        let tx = db.begin_transaction(&ctx, TransactionOptions::reading()).unwrap();
        let names = db.store_names(&ctx, &tx).unwrap();
        assert_eq!(names, vec!["alpha", "middle", "zebra"]);
    }

    #[test]
    fn remove_store_makes_it_unopenable_and_reclaimable() {
        let (_dir, db) = open_db();
        let ctx = Context::new();

        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        let store = db
            .new_store(&ctx, &tx, "doomed", StoreOptions::default(), None)
            .unwrap();
        let items: Vec<sop_btree::Item> = (0..50i64)
            .map(|i| sop_btree::Item::new(i, format!("v{i}")))
            .collect();
        store.add(&ctx, &items).unwrap();
        tx.commit(&ctx).unwrap();

        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        db.remove_store(&ctx, &tx, "doomed").unwrap();
        tx.commit(&ctx).unwrap();

        let tx = db.begin_transaction(&ctx, TransactionOptions::reading()).unwrap();
        assert!(matches!(
            db.open_store(&ctx, &tx, "doomed"),
            Err(Error::NotFound { .. })
        ));
        assert!(db.store_names(&ctx, &tx).unwrap().is_empty());
        // Node and value segments were queued; force the sweep.
        assert!(db.reclaim_now(&ctx).unwrap() > 0);
    }

    #[test]
    fn removing_missing_store_is_not_found() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        assert!(matches!(
            db.remove_store(&ctx, &tx, "ghost"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn open_store_twice_in_one_transaction_shares_state() {
        let (_dir, db) = open_db();
        let ctx = Context::new();
        let tx = db.begin_transaction(&ctx, TransactionOptions::writing()).unwrap();
        let first = db
            .new_store(&ctx, &tx, "shared", StoreOptions::default(), None)
            .unwrap();
        first.add(&ctx, &[sop_btree::Item::new("k", "v")]).unwrap();

        let second = db.open_store(&ctx, &tx, "shared").unwrap();
        assert!(second.find(&ctx, &Key::from("k")).unwrap());
        assert_eq!(second.count().unwrap(), 1);
    }
}
