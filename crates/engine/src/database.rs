//! Database: configuration lifecycle, component wiring and transaction
//! vending.
//!
//! `setup` persists the effective options as `dboptions.json` and returns
//! them (defaults invented, limits clamped), so a later `get_options`
//! round-trips exactly. `open` builds the data plane the options describe:
//! file registry and blob folders for standalone mode, a distributed cache
//! when configured, and one erasure-coded blob store per configured
//! pattern. Clustered deployments inject their registry adapter through
//! `open_clustered`; the engine does not embed a specific cluster client.

use crate::catalog;
use sop_concurrency::{commit_log, Transaction};
use sop_core::{
    Context, DatabaseId, DatabaseKind, DatabaseOptions, Error, Result, TransactionMode,
    TransactionOptions,
};
use sop_storage::{
    BlobStore, CacheStack, DistributedCache, ErasureBlobStore, FileBlobStore, FileRegistry,
    MemoryL2Cache, RedisCache, ReclamationQueue, Registry, DEFAULT_RETENTION,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const OPTIONS_FILE: &str = "dboptions.json";

/// A live database over one configured deployment.
pub struct Database {
    id: DatabaseId,
    options: DatabaseOptions,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) cache: Arc<CacheStack>,
    pub(crate) lock_backend: Arc<dyn DistributedCache>,
    pub(crate) reclaim: Arc<ReclamationQueue>,
    base_blobs: Arc<dyn BlobStore>,
    erasure: HashMap<String, Arc<ErasureBlobStore>>,
}

/// One transaction handle as seen by callers; store handles share it.
#[derive(Clone)]
pub struct DbTransaction {
    pub(crate) cell: Arc<Mutex<TxCell>>,
}

pub(crate) struct TxCell {
    pub tx: Transaction,
    /// Store name to attached slot, so opening a store twice inside one
    /// transaction yields one staged state instead of two fighting copies.
    pub attached: HashMap<String, usize>,
}

impl DbTransaction {
    pub fn id(&self) -> sop_core::TransactionId {
        self.cell.lock().tx.id()
    }

    pub fn mode(&self) -> TransactionMode {
        self.cell.lock().tx.mode()
    }

    /// Finalize the transaction; see the commit protocol in
    /// `sop-concurrency`.
    pub fn commit(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.cell.lock().tx.commit(ctx)
    }

    /// Discard staged work and release everything held.
    pub fn rollback(&self, ctx: &Context) -> Result<()> {
        self.cell.lock().tx.rollback(ctx)
    }
}

impl Database {
    /// Validate `options`, fill defaults, persist the result at the active
    /// folder and return it.
    pub fn setup(ctx: &Context, options: DatabaseOptions) -> Result<DatabaseOptions> {
        ctx.check()?;
        let mut effective = options.effective()?;
        let folder = effective.active_folder().clone();
        // Re-running setup over an existing database keeps its identity.
        if let Ok(existing) = Self::get_options(&folder) {
            if let Some(id) = existing.database_id {
                effective.database_id = Some(id);
            }
        }
        fs::create_dir_all(&folder)?;
        let path = folder.join(OPTIONS_FILE);
        let tmp = folder.join(format!("{}.tmp", OPTIONS_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(&effective)?)?;
        fs::rename(&tmp, &path)?;
        info!(?path, "database options persisted");
        Ok(effective)
    }

    /// Read back previously persisted options.
    pub fn get_options(path: impl AsRef<Path>) -> Result<DatabaseOptions> {
        let file = path.as_ref().join(OPTIONS_FILE);
        let bytes = fs::read(&file).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::not_found(format!("no database at {:?}", path.as_ref()))
            }
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Open the database previously set up at `path`.
    pub fn open(ctx: &Context, path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::get_options(&path)?;
        match options.kind {
            DatabaseKind::Standalone => Self::open_standalone(ctx, options),
            DatabaseKind::Clustered => Err(Error::invalid_config(
                "clustered databases need a registry adapter; use Database::open_clustered",
            )),
        }
    }

    /// Convenience: `setup` then `open` in one call.
    pub fn create(ctx: &Context, options: DatabaseOptions) -> Result<Self> {
        let effective = Self::setup(ctx, options)?;
        match effective.kind {
            DatabaseKind::Standalone => Self::open_standalone(ctx, effective),
            DatabaseKind::Clustered => Err(Error::invalid_config(
                "clustered databases need a registry adapter; use Database::open_clustered",
            )),
        }
    }

    fn open_standalone(ctx: &Context, options: DatabaseOptions) -> Result<Self> {
        let registry = Arc::new(FileRegistry::open(
            options.active_folder(),
            options.registry_hash_mod,
        )?) as Arc<dyn Registry>;
        let l2: Arc<dyn DistributedCache> = match &options.redis_config {
            Some(config) => Arc::new(RedisCache::connect(config)?),
            None => Arc::new(MemoryL2Cache::new()),
        };
        Self::assemble(ctx, options, registry, l2)
    }

    /// Open a clustered database with an injected registry adapter (the
    /// keyspace client is an external collaborator implementing
    /// `Registry`). The distributed cache is built from the options and is
    /// mandatory in this mode.
    pub fn open_clustered(
        ctx: &Context,
        options: DatabaseOptions,
        registry: Arc<dyn Registry>,
    ) -> Result<Self> {
        let options = options.effective()?;
        let redis = options
            .redis_config
            .as_ref()
            .ok_or_else(|| Error::invalid_config("clustered databases require redis_config"))?;
        let l2: Arc<dyn DistributedCache> = Arc::new(RedisCache::connect(redis)?);
        Self::assemble(ctx, options, registry, l2)
    }

    fn assemble(
        ctx: &Context,
        options: DatabaseOptions,
        registry: Arc<dyn Registry>,
        l2: Arc<dyn DistributedCache>,
    ) -> Result<Self> {
        let base_blobs = Arc::new(FileBlobStore::new(
            options.active_folder().clone(),
            options.passive_folder().cloned(),
        )) as Arc<dyn BlobStore>;

        let mut erasure = HashMap::new();
        if let Some(configs) = &options.erasure_config {
            for (pattern, config) in configs {
                erasure.insert(pattern.clone(), Arc::new(ErasureBlobStore::new(config.clone())?));
            }
        }

        let db = Database {
            id: options
                .database_id
                .ok_or_else(|| Error::invalid_config("options missing database_id; run setup"))?,
            cache: Arc::new(CacheStack::new(Some(l2.clone()))),
            lock_backend: l2,
            reclaim: Arc::new(ReclamationQueue::new(DEFAULT_RETENTION)),
            base_blobs,
            erasure,
            registry,
            options,
        };

        // Settle crash leftovers from logged commits that never published.
        let base = db.options.active_folder().clone();
        let resolve = |store_name: &str| db.blobs_for(store_name);
        match commit_log::sweep(ctx, &base, db.registry.as_ref(), &resolve, DEFAULT_RETENTION) {
            Ok(0) => {}
            Ok(settled) => debug!(settled, "commit logs settled at open"),
            Err(e) => warn!(error = %e, "commit log sweep failed at open"),
        }
        Ok(db)
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// The blob backend for a store: its erasure group when one matches
    /// the store name (exact first, then the `""` catch-all), the plain
    /// folder store otherwise. Internal stores always use the base folder.
    pub(crate) fn blobs_for(&self, store_name: &str) -> Arc<dyn BlobStore> {
        if store_name == catalog::CATALOG_STORE_NAME {
            return self.base_blobs.clone();
        }
        if let Some(store) = self.erasure.get(store_name) {
            return store.clone() as Arc<dyn BlobStore>;
        }
        if let Some(store) = self.erasure.get("") {
            return store.clone() as Arc<dyn BlobStore>;
        }
        self.base_blobs.clone()
    }

    /// Begin a transaction in the given mode.
    pub fn begin_transaction(
        &self,
        ctx: &Context,
        options: TransactionOptions,
    ) -> Result<DbTransaction> {
        ctx.check()?;
        let log_dir = options
            .logging
            .then(|| self.options.active_folder().clone());
        let tx = Transaction::new(
            &options,
            self.registry.clone(),
            self.cache.clone(),
            self.lock_backend.clone(),
            self.reclaim.clone(),
            log_dir,
        );
        Ok(DbTransaction {
            cell: Arc::new(Mutex::new(TxCell {
                tx,
                attached: HashMap::new(),
            })),
        })
    }

    /// Delete every segment whose retention window has passed. Entries are
    /// routed to the backend that wrote them.
    pub fn sweep_reclaimable(&self, ctx: &Context) -> Result<usize> {
        self.reclaim.sweep(ctx)
    }

    /// Test and teardown hook: reclaim everything queued immediately.
    pub fn reclaim_now(&self, ctx: &Context) -> Result<usize> {
        self.reclaim.reclaim_now(ctx)
    }
}
