//! Model store: named, versioned opaque artifacts chunked into a B-tree.
//!
//! One backing store per model store, composite-keyed on
//! `(model, version, chunk)` with actively persisted values, so multi-
//! megabyte artifacts stream to disk while the save runs instead of
//! ballooning the commit. Chunk `-1` is the manifest row carrying chunk
//! count, total length and caller metadata.

use crate::database::{Database, DbTransaction};
use crate::store::BtreeStore;
use serde::{Deserialize, Serialize};
use sop_btree::{Item, PagingInfo};
use sop_core::{
    Context, Error, FieldValue, IndexFieldSpecification, IndexSpecification, Key, Result,
    StoreOptions, ValueDataSize,
};
use std::collections::BTreeMap;
use tracing::info;

/// Artifact bytes per chunk row.
pub const CHUNK_SIZE: usize = 1 << 20;
const MANIFEST_CHUNK: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelManifest {
    pub chunk_count: i64,
    pub total_len: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Handle over one model store, bound to a transaction.
pub struct ModelStore {
    store: BtreeStore,
}

fn chunk_key(model: &str, version: i64, chunk: i64) -> Key {
    Key::composite([
        ("model", FieldValue::from(model)),
        ("version", FieldValue::Integer(version)),
        ("chunk", FieldValue::Integer(chunk)),
    ])
}

impl Database {
    pub fn new_model_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
    ) -> Result<ModelStore> {
        let mut options = StoreOptions {
            is_unique: true,
            is_primitive_key: false,
            slot_length: 100,
            description: "model artifacts".to_string(),
            ..Default::default()
        };
        options.set_value_data_size(ValueDataSize::Big);
        let spec = IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("model"),
            IndexFieldSpecification::ascending("version"),
            IndexFieldSpecification::ascending("chunk"),
        ]);
        let store = self.new_store(ctx, tx, name, options, Some(spec))?;
        Ok(ModelStore { store })
    }

    pub fn open_model_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
    ) -> Result<ModelStore> {
        Ok(ModelStore {
            store: self.open_store(ctx, tx, name)?,
        })
    }
}

impl ModelStore {
    fn manifest(&self, ctx: &Context, model: &str, version: i64) -> Result<Option<ModelManifest>> {
        if !self
            .store
            .find(ctx, &chunk_key(model, version, MANIFEST_CHUNK))?
        {
            return Ok(None);
        }
        let item = self
            .store
            .current_item(ctx)?
            .ok_or_else(|| Error::internal("manifest cursor vanished"))?;
        Ok(Some(serde_json::from_slice(&item.value)?))
    }

    /// Save (or replace) one artifact version.
    pub fn save(
        &self,
        ctx: &Context,
        model: &str,
        version: i64,
        bytes: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        if model.is_empty() {
            return Err(Error::invalid_config("model name must not be empty"));
        }
        // Stale chunks beyond the new tail must not survive a re-save.
        let old_chunks = self
            .manifest(ctx, model, version)?
            .map(|m| m.chunk_count)
            .unwrap_or(0);

        let chunk_count = bytes.chunks(CHUNK_SIZE).count() as i64;
        let manifest = ModelManifest {
            chunk_count,
            total_len: bytes.len() as u64,
            metadata,
        };
        self.store.upsert(
            ctx,
            &[Item {
                key: chunk_key(model, version, MANIFEST_CHUNK),
                value: serde_json::to_vec(&manifest)?,
                id: sop_core::ItemId::nil(),
            }],
        )?;
        for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
            self.store.upsert(
                ctx,
                &[Item {
                    key: chunk_key(model, version, index as i64),
                    value: chunk.to_vec(),
                    id: sop_core::ItemId::nil(),
                }],
            )?;
        }
        for stale in chunk_count..old_chunks {
            self.store.remove(ctx, &[chunk_key(model, version, stale)])?;
        }
        info!(model, version, bytes = bytes.len(), chunks = chunk_count, "model saved");
        Ok(())
    }

    /// Load one artifact version; `NotFound` when it does not exist.
    pub fn load(
        &self,
        ctx: &Context,
        model: &str,
        version: i64,
    ) -> Result<(Vec<u8>, BTreeMap<String, String>)> {
        let manifest = self
            .manifest(ctx, model, version)?
            .ok_or_else(|| Error::not_found(format!("model {:?} version {}", model, version)))?;
        let probes: Vec<Item> = (0..manifest.chunk_count)
            .map(|chunk| Item::probe(chunk_key(model, version, chunk)))
            .collect();
        let mut bytes = Vec::with_capacity(manifest.total_len as usize);
        if !probes.is_empty() {
            for item in self.store.get_values(ctx, &probes)? {
                bytes.extend_from_slice(&item.value);
            }
        }
        if bytes.len() as u64 != manifest.total_len {
            return Err(Error::data_loss(format!(
                "model {:?} version {}: expected {} bytes, reassembled {}",
                model,
                version,
                manifest.total_len,
                bytes.len()
            )));
        }
        Ok((bytes, manifest.metadata))
    }

    /// Delete one artifact version; false when it does not exist.
    pub fn delete(&self, ctx: &Context, model: &str, version: i64) -> Result<bool> {
        let Some(manifest) = self.manifest(ctx, model, version)? else {
            return Ok(false);
        };
        let mut keys: Vec<Key> = vec![chunk_key(model, version, MANIFEST_CHUNK)];
        keys.extend((0..manifest.chunk_count).map(|chunk| chunk_key(model, version, chunk)));
        self.store.remove(ctx, &keys)?;
        Ok(true)
    }

    /// Every `(model, version)` pair present, in order.
    pub fn list(&self, ctx: &Context) -> Result<Vec<(String, i64)>> {
        let mut out = Vec::new();
        if !self.store.first(ctx)? {
            return Ok(out);
        }
        loop {
            let page = self.store.get_keys(ctx, PagingInfo::forward(64))?;
            if page.is_empty() {
                break;
            }
            for item in page {
                let chunk = match item.key.field("chunk") {
                    Some(FieldValue::Integer(chunk)) => *chunk,
                    _ => continue,
                };
                if chunk != MANIFEST_CHUNK {
                    continue;
                }
                let (Some(FieldValue::String(model)), Some(FieldValue::Integer(version))) =
                    (item.key.field("model"), item.key.field("version"))
                else {
                    continue;
                };
                out.push((model.clone(), *version));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serde_round_trip() {
        let manifest = ModelManifest {
            chunk_count: 3,
            total_len: 2_500_000,
            metadata: [("framework".to_string(), "onnx".to_string())].into(),
        };
        let json = serde_json::to_vec(&manifest).unwrap();
        let back: ModelManifest = serde_json::from_slice(&json).unwrap();
        assert_eq!(manifest, back);
    }

    #[test]
    fn chunk_keys_sort_manifest_first() {
        let spec = IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("model"),
            IndexFieldSpecification::ascending("version"),
            IndexFieldSpecification::ascending("chunk"),
        ]);
        let manifest = chunk_key("m", 1, MANIFEST_CHUNK);
        let first_chunk = chunk_key("m", 1, 0);
        assert_eq!(
            spec.compare(&manifest, &first_chunk),
            std::cmp::Ordering::Less
        );
    }
}
