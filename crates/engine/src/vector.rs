//! Vector store: approximate nearest-neighbor search via coarse
//! quantization, layered on ordinary B-tree stores so it shares the
//! database's transactions, caching and replication.
//!
//! Layout per vector store `name`:
//!
//! - `name#centroids` — centroid id (integer) to centroid vector.
//! - `name#vectors` — composite key `(c, id)` to the embedding and payload;
//!   one partition per centroid, scanned in order during search.
//! - `name#ids` — vector id to its current centroid, so updates and
//!   removals find their partition without scanning.
//!
//! Search ranks centroids by distance to the query, scans the `nprobe`
//! nearest partitions and returns the best `k` candidates. `optimize`
//! re-clusters with k-means in its own dedicated transaction; it never
//! piggybacks on a caller's transaction.

use crate::database::{Database, DbTransaction};
use crate::store::BtreeStore;
use serde::{Deserialize, Serialize};
use sop_btree::{Item, PagingInfo};
use sop_core::{
    Context, Error, FieldValue, IndexFieldSpecification, IndexSpecification, Key, Result,
    StoreOptions, TransactionOptions, ValueDataSize,
};
use tracing::{debug, info};

const CENTROIDS_SUFFIX: &str = "#centroids";
const VECTORS_SUFFIX: &str = "#vectors";
const IDS_SUFFIX: &str = "#ids";

/// Default number of centroid partitions probed by a search.
pub const DEFAULT_NPROBE: usize = 4;
const KMEANS_ITERATIONS: usize = 8;

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorRecord {
    embedding: Vec<f32>,
    payload: Vec<u8>,
}

/// Handle over the three backing stores, bound to one transaction.
pub struct VectorStore {
    name: String,
    dimension: usize,
    centroids: BtreeStore,
    vectors: BtreeStore,
    ids: BtreeStore,
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn vector_key(centroid: i64, id: &str) -> Key {
    Key::composite([
        ("c", FieldValue::Integer(centroid)),
        ("id", FieldValue::from(id)),
    ])
}

fn centroid_probe(centroid: i64) -> Key {
    // No `id` field: sorts before every real key of the partition.
    Key::composite([("c", FieldValue::Integer(centroid))])
}

fn dimension_description(dimension: usize) -> String {
    format!("dimension={}", dimension)
}

fn parse_dimension(description: &str) -> Result<usize> {
    description
        .strip_prefix("dimension=")
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| Error::internal(format!("malformed vector store description {:?}", description)))
}

impl Database {
    /// Create the three backing stores of a vector store.
    pub fn new_vector_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
        dimension: usize,
    ) -> Result<VectorStore> {
        if dimension == 0 {
            return Err(Error::invalid_config("vector dimension must be positive"));
        }
        let mut centroid_options = StoreOptions {
            is_unique: true,
            slot_length: 100,
            description: dimension_description(dimension),
            ..Default::default()
        };
        centroid_options.set_value_data_size(ValueDataSize::Small);
        let centroids =
            self.new_store(ctx, tx, &format!("{name}{CENTROIDS_SUFFIX}"), centroid_options, None)?;

        let mut vector_options = StoreOptions {
            is_unique: true,
            is_primitive_key: false,
            slot_length: 100,
            ..Default::default()
        };
        vector_options.set_value_data_size(ValueDataSize::Medium);
        let spec = IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("c"),
            IndexFieldSpecification::ascending("id"),
        ]);
        let vectors = self.new_store(
            ctx,
            tx,
            &format!("{name}{VECTORS_SUFFIX}"),
            vector_options,
            Some(spec),
        )?;

        let mut id_options = StoreOptions {
            is_unique: true,
            slot_length: 100,
            ..Default::default()
        };
        id_options.set_value_data_size(ValueDataSize::Small);
        let ids = self.new_store(ctx, tx, &format!("{name}{IDS_SUFFIX}"), id_options, None)?;

        info!(store = name, dimension, "vector store created");
        Ok(VectorStore {
            name: name.to_string(),
            dimension,
            centroids,
            vectors,
            ids,
        })
    }

    /// Open an existing vector store inside `tx`.
    pub fn open_vector_store(
        &self,
        ctx: &Context,
        tx: &DbTransaction,
        name: &str,
    ) -> Result<VectorStore> {
        let centroids = self.open_store(ctx, tx, &format!("{name}{CENTROIDS_SUFFIX}"))?;
        let vectors = self.open_store(ctx, tx, &format!("{name}{VECTORS_SUFFIX}"))?;
        let ids = self.open_store(ctx, tx, &format!("{name}{IDS_SUFFIX}"))?;
        let dimension = parse_dimension(&centroids.store_info().description)?;
        Ok(VectorStore {
            name: name.to_string(),
            dimension,
            centroids,
            vectors,
            ids,
        })
    }

    /// Re-cluster a vector store with k-means. Runs in its own dedicated
    /// transaction so a failed optimize leaves the store untouched and a
    /// caller transaction is never committed behind its back.
    pub fn optimize_vector_store(
        &self,
        ctx: &Context,
        name: &str,
        target_centroids: usize,
    ) -> Result<()> {
        if target_centroids == 0 {
            return Err(Error::invalid_config("target centroid count must be positive"));
        }
        let tx = self.begin_transaction(ctx, TransactionOptions::writing())?;
        let result = (|| {
            let store = self.open_vector_store(ctx, &tx, name)?;
            store.rebuild(ctx, target_centroids)
        })();
        match result {
            Ok(()) => tx.commit(ctx),
            Err(e) => {
                let _ = tx.rollback(ctx);
                Err(e)
            }
        }
    }
}

impl VectorStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> Result<u64> {
        self.ids.count()
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(Error::invalid_config(format!(
                "vector has dimension {}, store {:?} expects {}",
                embedding.len(),
                self.name,
                self.dimension
            )));
        }
        Ok(())
    }

    fn load_centroids(&self, ctx: &Context) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut out = Vec::new();
        if !self.centroids.first(ctx)? {
            return Ok(out);
        }
        loop {
            let page = self.centroids.get_items(ctx, PagingInfo::forward(64))?;
            if page.is_empty() {
                break;
            }
            for item in page {
                let Key::Integer(id) = item.key else {
                    return Err(Error::internal("centroid key is not an integer"));
                };
                let embedding: Vec<f32> = bincode::deserialize(&item.value)
                    .map_err(|e| Error::serialization(format!("centroid record: {e}")))?;
                out.push((id, embedding));
            }
        }
        Ok(out)
    }

    fn nearest_centroid(centroids: &[(i64, Vec<f32>)], embedding: &[f32]) -> Option<i64> {
        centroids
            .iter()
            .map(|(id, c)| (*id, squared_distance(c, embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Insert or replace one vector.
    pub fn upsert(&self, ctx: &Context, id: &str, embedding: &[f32], payload: &[u8]) -> Result<()> {
        self.check_dimension(embedding)?;

        // A replaced vector may move partitions; drop the old copy first.
        if let Some(old_centroid) = self.centroid_of(ctx, id)? {
            self.vectors.remove(ctx, &[vector_key(old_centroid, id)])?;
        }

        let centroids = self.load_centroids(ctx)?;
        let centroid = match Self::nearest_centroid(&centroids, embedding) {
            Some(centroid) => centroid,
            None => {
                // First vector seeds the first partition.
                self.centroids.add(
                    ctx,
                    &[Item {
                        key: Key::from(0i64),
                        value: bincode::serialize(&embedding.to_vec())?,
                        id: sop_core::ItemId::nil(),
                    }],
                )?;
                0
            }
        };

        let record = VectorRecord {
            embedding: embedding.to_vec(),
            payload: payload.to_vec(),
        };
        self.vectors.upsert(
            ctx,
            &[Item {
                key: vector_key(centroid, id),
                value: bincode::serialize(&record)?,
                id: sop_core::ItemId::nil(),
            }],
        )?;
        self.ids.upsert(
            ctx,
            &[Item {
                key: Key::from(id),
                value: bincode::serialize(&centroid)?,
                id: sop_core::ItemId::nil(),
            }],
        )?;
        Ok(())
    }

    fn centroid_of(&self, ctx: &Context, id: &str) -> Result<Option<i64>> {
        if !self.ids.find(ctx, &Key::from(id))? {
            return Ok(None);
        }
        let item = self
            .ids
            .current_item(ctx)?
            .ok_or_else(|| Error::internal("id cursor vanished"))?;
        let centroid: i64 = bincode::deserialize(&item.value)
            .map_err(|e| Error::serialization(format!("id record: {e}")))?;
        Ok(Some(centroid))
    }

    /// Fetch one vector back.
    pub fn get(&self, ctx: &Context, id: &str) -> Result<Option<(Vec<f32>, Vec<u8>)>> {
        let Some(centroid) = self.centroid_of(ctx, id)? else {
            return Ok(None);
        };
        let found = self
            .vectors
            .get_values(ctx, &[Item::probe(vector_key(centroid, id))])?;
        let record: VectorRecord = bincode::deserialize(&found[0].value)
            .map_err(|e| Error::serialization(format!("vector record: {e}")))?;
        Ok(Some((record.embedding, record.payload)))
    }

    /// Remove a vector; false when the id is unknown.
    pub fn remove(&self, ctx: &Context, id: &str) -> Result<bool> {
        let Some(centroid) = self.centroid_of(ctx, id)? else {
            return Ok(false);
        };
        self.vectors.remove(ctx, &[vector_key(centroid, id)])?;
        self.ids.remove(ctx, &[Key::from(id)])?;
        Ok(true)
    }

    /// Scan one centroid partition into `(id, record)` pairs.
    fn scan_partition(&self, ctx: &Context, centroid: i64) -> Result<Vec<(String, VectorRecord)>> {
        let mut out = Vec::new();
        self.vectors.find(ctx, &centroid_probe(centroid))?;
        'pages: loop {
            let page = self.vectors.get_items(ctx, PagingInfo::forward(64))?;
            if page.is_empty() {
                break;
            }
            for item in page {
                match item.key.field("c") {
                    Some(FieldValue::Integer(c)) if *c == centroid => {}
                    _ => break 'pages,
                }
                let Some(FieldValue::String(id)) = item.key.field("id") else {
                    return Err(Error::internal("vector key missing id field"));
                };
                let record: VectorRecord = bincode::deserialize(&item.value)
                    .map_err(|e| Error::serialization(format!("vector record: {e}")))?;
                out.push((id.clone(), record));
            }
        }
        Ok(out)
    }

    /// Approximate k-nearest-neighbor search over the `nprobe` closest
    /// partitions (0 selects the default).
    pub fn search(
        &self,
        ctx: &Context,
        query: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>> {
        self.check_dimension(query)?;
        let nprobe = if nprobe == 0 { DEFAULT_NPROBE } else { nprobe };
        let mut centroids = self.load_centroids(ctx)?;
        centroids.sort_by(|a, b| {
            squared_distance(&a.1, query).total_cmp(&squared_distance(&b.1, query))
        });

        let mut hits = Vec::new();
        for (centroid, _) in centroids.into_iter().take(nprobe) {
            for (id, record) in self.scan_partition(ctx, centroid)? {
                hits.push(SearchHit {
                    distance: squared_distance(&record.embedding, query),
                    id,
                    payload: record.payload,
                });
            }
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    /// Collect everything, run k-means, rewrite all three stores. Called
    /// by `Database::optimize_vector_store` inside its dedicated
    /// transaction.
    fn rebuild(&self, ctx: &Context, target_centroids: usize) -> Result<()> {
        let old_centroids = self.load_centroids(ctx)?;
        let mut entries: Vec<(String, VectorRecord)> = Vec::new();
        for (centroid, _) in &old_centroids {
            entries.extend(self.scan_partition(ctx, *centroid)?);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let embeddings: Vec<&[f32]> = entries.iter().map(|(_, r)| r.embedding.as_slice()).collect();
        let centroids = kmeans(&embeddings, target_centroids.min(entries.len()), self.dimension);

        // Remove the old layout.
        for (centroid, _) in &old_centroids {
            for (id, _) in self.scan_partition(ctx, *centroid)? {
                self.vectors.remove(ctx, &[vector_key(*centroid, &id)])?;
            }
            self.centroids.remove(ctx, &[Key::from(*centroid)])?;
        }

        // Write centroids and reassigned vectors.
        for (index, centroid) in centroids.iter().enumerate() {
            self.centroids.add(
                ctx,
                &[Item {
                    key: Key::from(index as i64),
                    value: bincode::serialize(centroid)?,
                    id: sop_core::ItemId::nil(),
                }],
            )?;
        }
        for (id, record) in entries {
            let assigned = centroids
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    squared_distance(a.1, &record.embedding)
                        .total_cmp(&squared_distance(b.1, &record.embedding))
                })
                .map(|(i, _)| i as i64)
                .unwrap_or(0);
            self.vectors.add(
                ctx,
                &[Item {
                    key: vector_key(assigned, &id),
                    value: bincode::serialize(&record)?,
                    id: sop_core::ItemId::nil(),
                }],
            )?;
            self.ids.upsert(
                ctx,
                &[Item {
                    key: Key::from(id.as_str()),
                    value: bincode::serialize(&assigned)?,
                    id: sop_core::ItemId::nil(),
                }],
            )?;
        }
        debug!(store = %self.name, centroids = centroids.len(), "vector store re-clustered");
        Ok(())
    }
}

/// Plain Lloyd iterations with deterministic, evenly spaced seeding. Empty
/// clusters keep their previous centroid.
fn kmeans(points: &[&[f32]], k: usize, dimension: usize) -> Vec<Vec<f32>> {
    let step = (points.len() / k).max(1);
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| points[(i * step).min(points.len() - 1)].to_vec())
        .collect();

    for _ in 0..KMEANS_ITERATIONS {
        let mut sums = vec![vec![0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for point in points {
            let assigned = centroids
                .iter()
                .enumerate()
                .min_by(|a, b| {
                    squared_distance(a.1, point).total_cmp(&squared_distance(b.1, point))
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            counts[assigned] += 1;
            for (sum, value) in sums[assigned].iter_mut().zip(*point) {
                *sum += value;
            }
        }
        for (index, (sum, count)) in sums.into_iter().zip(&counts).enumerate() {
            if *count > 0 {
                centroids[index] = sum.into_iter().map(|s| s / *count as f32).collect();
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squared_distance_basics() {
        assert_eq!(squared_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
        assert_eq!(squared_distance(&[1.0], &[1.0]), 0.0);
    }

    #[test]
    fn kmeans_separates_obvious_clusters() {
        let points: Vec<Vec<f32>> = (0..10)
            .map(|i| {
                if i < 5 {
                    vec![0.0 + i as f32 * 0.01, 0.0]
                } else {
                    vec![10.0 + i as f32 * 0.01, 10.0]
                }
            })
            .collect();
        let refs: Vec<&[f32]> = points.iter().map(|p| p.as_slice()).collect();
        let centroids = kmeans(&refs, 2, 2);
        assert_eq!(centroids.len(), 2);
        let spread = squared_distance(&centroids[0], &centroids[1]);
        assert!(spread > 50.0, "centroids should land in separate clusters");
    }

    #[test]
    fn dimension_description_round_trips() {
        assert_eq!(parse_dimension(&dimension_description(384)).unwrap(), 384);
        assert!(parse_dimension("garbage").is_err());
    }

    #[test]
    fn centroid_probe_sorts_before_partition() {
        let spec = IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("c"),
            IndexFieldSpecification::ascending("id"),
        ]);
        let probe = centroid_probe(3);
        let first = vector_key(3, "a");
        assert_eq!(
            spec.compare(&probe, &first),
            std::cmp::Ordering::Less
        );
        let prev_partition = vector_key(2, "zzz");
        assert_eq!(
            spec.compare(&prev_partition, &probe),
            std::cmp::Ordering::Less
        );
    }
}
