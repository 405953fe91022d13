//! Transaction state: MVCC read/write sets and the staged view of every
//! store the transaction touches.
//!
//! A transaction is owned by one thread. Reads resolve nodes through the
//! registry exactly once and pin that `(segment, version)` for the rest of
//! the transaction (the snapshot); mutations stage whole replacement nodes
//! in an overlay that readers of the same transaction see immediately
//! (read-your-writes). Nothing touches the registry or the blob store in a
//! visible way until commit.
//!
//! State machine: `Open` → `Dirty` (first mutation) → `Committing` →
//! `Committed` | `Aborted`. Operations on a finished transaction fail with
//! `InvalidState`.

use sop_btree::{Node, NodeStore, ValueRef};
use sop_core::{
    Context, Error, KeyComparator, LogicalId, Result, SegmentId, StoreId, StoreInfo,
    TransactionId, TransactionMode, TransactionOptions, ValuePlacement,
};
use sop_storage::{
    BlobStore, CacheClass, CacheStack, CachedValue, DistributedCache, ReclamationQueue, Registry,
    RegistryEntry,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// The registry entry holding a store's metadata record is addressed by the
/// store uuid itself, so bootstrap never needs a directory of directories.
pub fn store_info_logical_id(store_uuid: StoreId) -> LogicalId {
    LogicalId::from_bytes(*store_uuid.as_bytes())
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Dirty,
    Committing,
    Committed,
    Aborted,
}

/// Per-store staged state inside one transaction.
pub(crate) struct StoreTxState {
    pub info: StoreInfo,
    /// Registry version of the store-info entry when it was read (0 for a
    /// store created by this transaction).
    pub info_version: u64,
    pub info_dirty: bool,
    pub comparator: KeyComparator,
    pub blobs: Arc<dyn BlobStore>,

    /// Registry entries pinned at first read: the snapshot.
    pub resolved: HashMap<LogicalId, RegistryEntry>,
    /// Node versions this transaction depends on, validated at commit.
    pub read_set: HashMap<LogicalId, u64>,
    /// Read-your-writes overlay.
    pub staged_nodes: HashMap<LogicalId, Arc<Node>>,
    /// Nodes rewritten or created here (subset of `staged_nodes` keys).
    pub dirty_nodes: HashSet<LogicalId>,
    /// Nodes that did not exist before this transaction.
    pub new_nodes: HashSet<LogicalId>,
    /// Nodes removed by merges; their registry entries die at publish.
    pub deleted_nodes: HashSet<LogicalId>,

    /// Deferred value blobs (separate, commit-written placement).
    pub staged_values: HashMap<SegmentId, Vec<u8>>,
    /// Actively persisted value blobs already on disk, undone on rollback.
    pub persisted_values: Vec<SegmentId>,
    /// Replaced or removed value blobs, reclaimed after publish.
    pub deleted_values: Vec<SegmentId>,
}

impl StoreTxState {
    fn new(
        info: StoreInfo,
        info_version: u64,
        comparator: KeyComparator,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        StoreTxState {
            info,
            info_version,
            info_dirty: false,
            comparator,
            blobs,
            resolved: HashMap::new(),
            read_set: HashMap::new(),
            staged_nodes: HashMap::new(),
            dirty_nodes: HashSet::new(),
            new_nodes: HashSet::new(),
            deleted_nodes: HashSet::new(),
            staged_values: HashMap::new(),
            persisted_values: Vec::new(),
            deleted_values: Vec::new(),
        }
    }

    pub fn has_writes(&self) -> bool {
        self.info_dirty
            || !self.dirty_nodes.is_empty()
            || !self.deleted_nodes.is_empty()
            || !self.staged_values.is_empty()
            || !self.persisted_values.is_empty()
    }
}

/// One logical unit of work across any number of stores in a database.
pub struct Transaction {
    id: TransactionId,
    mode: TransactionMode,
    logging: bool,
    deadline: Instant,
    state: TxState,
    ctx: Context,

    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) cache: Arc<CacheStack>,
    pub(crate) lock_backend: Arc<dyn DistributedCache>,
    pub(crate) reclaim: Arc<ReclamationQueue>,
    /// Where commit sidecar logs live when `logging` is on.
    pub(crate) log_dir: Option<PathBuf>,

    pub(crate) stores: Vec<StoreTxState>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: &TransactionOptions,
        registry: Arc<dyn Registry>,
        cache: Arc<CacheStack>,
        lock_backend: Arc<dyn DistributedCache>,
        reclaim: Arc<ReclamationQueue>,
        log_dir: Option<PathBuf>,
    ) -> Self {
        let id = TransactionId::new();
        debug!(tx = %id, mode = ?options.mode, "transaction begun");
        Transaction {
            id,
            mode: options.mode,
            logging: options.logging,
            deadline: Instant::now() + options.max_duration(),
            state: TxState::Open,
            ctx: Context::new(),
            registry,
            cache,
            lock_backend,
            reclaim,
            log_dir,
            stores: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn logging(&self) -> bool {
        self.logging
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TxState::Open | TxState::Dirty)
    }

    /// Fail unless the transaction can still accept operations. A blown
    /// deadline aborts the transaction on the spot.
    pub fn ensure_active(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::invalid_state(format!(
                "transaction {} is {:?}",
                self.id, self.state
            )));
        }
        if Instant::now() > self.deadline {
            self.state = TxState::Aborted;
            return Err(Error::Timeout);
        }
        Ok(())
    }

    pub(crate) fn mark_dirty(&mut self) -> Result<()> {
        if self.mode == TransactionMode::ForReading {
            return Err(Error::invalid_state(
                "transaction is read-only; begin a writing transaction to mutate",
            ));
        }
        if self.state == TxState::Open {
            self.state = TxState::Dirty;
        }
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn expire_for_tests(&mut self) {
        self.deadline = Instant::now() - std::time::Duration::from_secs(1);
    }

    /// Bind a store to this transaction; returns the slot used to obtain
    /// `NodeStore` views. `info_version` and `info_segment` describe the
    /// store-info registry entry at read time (version 0 and no segment
    /// when this transaction creates the store); the entry joins the read
    /// set so structural races on the store surface as conflicts.
    pub fn attach_store(
        &mut self,
        info: StoreInfo,
        info_version: u64,
        info_segment: Option<SegmentId>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<usize> {
        self.ensure_active()?;
        let comparator = info.comparator()?;
        if info_version == 0 {
            self.mark_dirty()?;
        }
        let mut state = StoreTxState::new(info, info_version, comparator, blobs);
        state.info_dirty = info_version == 0;
        if info_version > 0 {
            let info_id = store_info_logical_id(state.info.store_uuid);
            state.read_set.insert(info_id, info_version);
            if let Some(segment_id) = info_segment {
                state.resolved.insert(
                    info_id,
                    RegistryEntry {
                        logical_id: info_id,
                        segment_id,
                        version: info_version,
                    },
                );
            }
        }
        self.stores.push(state);
        Ok(self.stores.len() - 1)
    }

    pub fn store_info(&self, slot: usize) -> &StoreInfo {
        &self.stores[slot].info
    }

    /// Stage a replacement metadata record for an attached store. The
    /// caller (the catalog layer) is responsible for the structural
    /// immutability checks; this only swaps the record and rebuilds the
    /// comparator.
    pub fn replace_store_info(&mut self, slot: usize, info: StoreInfo) -> Result<()> {
        self.ensure_active()?;
        self.mark_dirty()?;
        let comparator = info.comparator()?;
        let store = &mut self.stores[slot];
        store.info = info;
        store.comparator = comparator;
        store.info_dirty = true;
        Ok(())
    }

    /// Store slots attached so far, newest last.
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// A `NodeStore` view over one attached store.
    pub fn store_view(&mut self, slot: usize) -> StoreView<'_> {
        StoreView { tx: self, slot }
    }

    /// Discard all staged state. Actively persisted value blobs are deleted
    /// (they exist only on behalf of this transaction); everything else was
    /// never visible.
    pub fn rollback(&mut self, ctx: &Context) -> Result<()> {
        if matches!(self.state, TxState::Committed | TxState::Aborted) {
            return Ok(());
        }
        for store in &mut self.stores {
            for segment in store.persisted_values.drain(..) {
                if let Err(e) = store.blobs.remove(ctx, segment) {
                    tracing::warn!(tx = %self.id, segment = %segment, error = %e,
                                   "rollback could not delete persisted value");
                }
            }
            store.staged_nodes.clear();
            store.dirty_nodes.clear();
            store.new_nodes.clear();
            store.deleted_nodes.clear();
            store.staged_values.clear();
            store.deleted_values.clear();
            store.info_dirty = false;
        }
        self.state = TxState::Aborted;
        debug!(tx = %self.id, "transaction rolled back");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node resolution shared by views and the commit path
    // ------------------------------------------------------------------

    /// Resolve a logical id to its pinned registry entry, consulting the
    /// snapshot first, then the cache, then the registry.
    pub(crate) fn resolve_entry(&mut self, slot: usize, id: LogicalId) -> Result<RegistryEntry> {
        if let Some(entry) = self.stores[slot].resolved.get(&id) {
            return Ok(*entry);
        }
        let key = id.to_string();
        let ttl = self.stores[slot].info.cache_config.registry_ttl();
        let sliding = self.stores[slot].info.cache_config.is_registry_cache_ttl;
        let cached = self.cache.get(CacheClass::RegistryEntry, &key, 0)?;
        let entry = match cached {
            Some(value) => decode_registry_entry(&value.bytes)?,
            None => {
                let found = self.registry.lookup(&self.ctx, &[id])?;
                let entry = found[0].ok_or_else(|| {
                    Error::not_found(format!("registry entry for node {}", id))
                })?;
                self.cache.put(
                    CacheClass::RegistryEntry,
                    &key,
                    CachedValue::new(entry.version, encode_registry_entry(&entry)),
                    ttl,
                    sliding,
                    true,
                )?;
                entry
            }
        };
        let store = &mut self.stores[slot];
        store.resolved.insert(id, entry);
        store.read_set.insert(id, entry.version);
        Ok(entry)
    }

    pub(crate) fn read_node_at(&mut self, slot: usize, id: LogicalId) -> Result<Arc<Node>> {
        if self.stores[slot].deleted_nodes.contains(&id) {
            return Err(Error::internal(format!(
                "read of node {} deleted in this transaction",
                id
            )));
        }
        if let Some(node) = self.stores[slot].staged_nodes.get(&id) {
            return Ok(Arc::clone(node));
        }
        let entry = self.resolve_entry(slot, id)?;
        let key = id.to_string();
        let ttl = self.stores[slot].info.cache_config.node_ttl();
        let sliding = self.stores[slot].info.cache_config.is_node_cache_ttl;
        if let Some(hit) = self.cache.get(CacheClass::Node, &key, entry.version)? {
            let node = Node::decode(&hit.bytes)?;
            let node = Arc::new(node);
            self.stores[slot]
                .staged_nodes
                .insert(id, Arc::clone(&node));
            return Ok(node);
        }
        let bytes = self.stores[slot].blobs.read(&self.ctx, entry.segment_id)?;
        let node = Node::decode(&bytes)?;
        if node.node_id != id {
            return Err(Error::data_loss(format!(
                "segment {} holds node {}, expected {}",
                entry.segment_id, node.node_id, id
            )));
        }
        self.cache.put(
            CacheClass::Node,
            &key,
            CachedValue::new(entry.version, bytes),
            ttl,
            sliding,
            true,
        )?;
        let node = Arc::new(node);
        self.stores[slot]
            .staged_nodes
            .insert(id, Arc::clone(&node));
        Ok(node)
    }

    pub(crate) fn stage_node_at(&mut self, slot: usize, node: Node) -> Result<()> {
        self.ensure_active()?;
        self.mark_dirty()?;
        let id = node.node_id;
        let store = &mut self.stores[slot];
        if !store.resolved.contains_key(&id) && !store.dirty_nodes.contains(&id) {
            store.new_nodes.insert(id);
        }
        store.deleted_nodes.remove(&id);
        store.dirty_nodes.insert(id);
        store.staged_nodes.insert(id, Arc::new(node));
        Ok(())
    }

    pub(crate) fn delete_node_at(&mut self, slot: usize, id: LogicalId) -> Result<()> {
        self.ensure_active()?;
        self.mark_dirty()?;
        let store = &mut self.stores[slot];
        store.staged_nodes.remove(&id);
        store.dirty_nodes.remove(&id);
        if store.new_nodes.remove(&id) {
            // Created and destroyed inside this transaction: no trace.
            return Ok(());
        }
        store.deleted_nodes.insert(id);
        Ok(())
    }

    pub(crate) fn write_value_at(&mut self, slot: usize, bytes: &[u8]) -> Result<ValueRef> {
        self.ensure_active()?;
        self.mark_dirty()?;
        match self.stores[slot].info.value_placement {
            ValuePlacement::InNode => Ok(ValueRef::Inline(bytes.to_vec())),
            ValuePlacement::SeparateCached => {
                let segment = SegmentId::new();
                self.stores[slot]
                    .staged_values
                    .insert(segment, bytes.to_vec());
                Ok(ValueRef::Blob(segment))
            }
            ValuePlacement::SeparatePersisted => {
                // Written while the operation runs; commit only has to
                // publish the reference.
                let segment = SegmentId::new();
                let store = &mut self.stores[slot];
                store.blobs.write(&self.ctx, segment, bytes)?;
                store.persisted_values.push(segment);
                Ok(ValueRef::Blob(segment))
            }
        }
    }

    pub(crate) fn read_value_at(&mut self, slot: usize, value: &ValueRef) -> Result<Vec<u8>> {
        match value {
            ValueRef::Inline(bytes) => Ok(bytes.clone()),
            ValueRef::Blob(segment) => {
                if let Some(staged) = self.stores[slot].staged_values.get(segment) {
                    return Ok(staged.clone());
                }
                let key = segment.to_string();
                let globally_cached =
                    self.stores[slot].info.value_placement == ValuePlacement::SeparateCached;
                if globally_cached {
                    if let Some(hit) = self.cache.get(CacheClass::ValueBlob, &key, 0)? {
                        return Ok(hit.bytes);
                    }
                }
                let bytes = self.stores[slot].blobs.read(&self.ctx, *segment)?;
                if globally_cached {
                    let ttl = self.stores[slot].info.cache_config.value_data_ttl();
                    let sliding = self.stores[slot].info.cache_config.is_value_data_cache_ttl;
                    // Value segments are immutable; version is constant.
                    self.cache.put(
                        CacheClass::ValueBlob,
                        &key,
                        CachedValue::new(1, bytes.clone()),
                        ttl,
                        sliding,
                        true,
                    )?;
                }
                Ok(bytes)
            }
        }
    }

    pub(crate) fn delete_value_at(&mut self, slot: usize, value: &ValueRef) -> Result<()> {
        self.ensure_active()?;
        self.mark_dirty()?;
        let ValueRef::Blob(segment) = value else {
            return Ok(());
        };
        let store = &mut self.stores[slot];
        if store.staged_values.remove(segment).is_some() {
            return Ok(());
        }
        if let Some(pos) = store.persisted_values.iter().position(|s| s == segment) {
            // Written by this transaction: undo it directly.
            store.persisted_values.swap_remove(pos);
            return store.blobs.remove(&self.ctx, *segment);
        }
        // Pre-existing blob: stays readable until after publish.
        store.deleted_values.push(*segment);
        Ok(())
    }
}

pub(crate) fn encode_registry_entry(entry: &RegistryEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(entry.logical_id.as_bytes());
    out.extend_from_slice(entry.segment_id.as_bytes());
    out.extend_from_slice(&entry.version.to_le_bytes());
    out
}

fn decode_registry_entry(bytes: &[u8]) -> Result<RegistryEntry> {
    if bytes.len() != 40 {
        return Err(Error::serialization("registry cache entry size"));
    }
    Ok(RegistryEntry {
        logical_id: LogicalId::from_bytes(bytes[0..16].try_into().unwrap()),
        segment_id: SegmentId::from_bytes(bytes[16..32].try_into().unwrap()),
        version: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
    })
}

/// `NodeStore` implementation over one attached store.
pub struct StoreView<'t> {
    tx: &'t mut Transaction,
    slot: usize,
}

impl StoreView<'_> {
    fn info(&self) -> &StoreInfo {
        &self.tx.stores[self.slot].info
    }
}

impl NodeStore for StoreView<'_> {
    fn comparator(&self) -> &KeyComparator {
        &self.tx.stores[self.slot].comparator
    }

    fn slot_length(&self) -> usize {
        self.info().slot_length
    }

    fn is_unique(&self) -> bool {
        self.info().is_unique
    }

    fn leaf_load_balancing(&self) -> bool {
        self.info().leaf_load_balancing
    }

    fn value_placement(&self) -> ValuePlacement {
        self.info().value_placement
    }

    fn root(&self) -> Option<LogicalId> {
        self.info().root_node.map(|handle| handle.logical_id)
    }

    fn set_root(&mut self, root: Option<LogicalId>) -> Result<()> {
        self.tx.ensure_active()?;
        self.tx.mark_dirty()?;
        let store = &mut self.tx.stores[self.slot];
        store.info.root_node =
            root.map(|id| sop_core::Handle::new(id, SegmentId::nil(), store.info.version + 1));
        store.info_dirty = true;
        Ok(())
    }

    fn item_count(&self) -> u64 {
        self.info().item_count
    }

    fn set_item_count(&mut self, count: u64) -> Result<()> {
        self.tx.ensure_active()?;
        self.tx.mark_dirty()?;
        let store = &mut self.tx.stores[self.slot];
        store.info.item_count = count;
        store.info_dirty = true;
        Ok(())
    }

    fn read_node(&mut self, id: LogicalId) -> Result<Arc<Node>> {
        self.tx.read_node_at(self.slot, id)
    }

    fn allocate_node_id(&mut self) -> LogicalId {
        LogicalId::new()
    }

    fn stage_node(&mut self, node: Node) -> Result<()> {
        self.tx.stage_node_at(self.slot, node)
    }

    fn delete_node(&mut self, id: LogicalId) -> Result<()> {
        self.tx.delete_node_at(self.slot, id)
    }

    fn write_value(&mut self, bytes: &[u8]) -> Result<ValueRef> {
        self.tx.write_value_at(self.slot, bytes)
    }

    fn read_value(&mut self, value: &ValueRef) -> Result<Vec<u8>> {
        self.tx.read_value_at(self.slot, value)
    }

    fn delete_value(&mut self, value: &ValueRef) -> Result<()> {
        self.tx.delete_value_at(self.slot, value)
    }
}

