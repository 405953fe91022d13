//! Configuration surface: database, store and transaction options.
//!
//! `DatabaseOptions` is what `setup` persists as `dboptions.json`; the
//! effective (defaulted, clamped) form is returned to the caller so a
//! follow-up `get_options` round-trips exactly.

use crate::error::{Error, Result};
use crate::types::DatabaseId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Registry bucket-count lower bound. 250 buckets of 4 KiB give a 1 MiB
/// registry segment.
pub const MIN_REGISTRY_HASH_MOD: usize = 250;
/// Upper bound; 750k buckets give a 3 GiB registry segment.
pub const MAX_REGISTRY_HASH_MOD: usize = 750_000;

/// Deployment flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Standalone,
    Clustered,
}

/// Reed–Solomon replication parameters for blobs matching one store-name
/// pattern. Losing up to `parity_shards_count` drives keeps reads and
/// writes available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureCodingConfig {
    pub data_shards_count: usize,
    pub parity_shards_count: usize,
    /// One folder per drive; length must equal data + parity.
    pub base_folder_paths_across_drives: Vec<PathBuf>,
    /// Rewrite missing or corrupt shards after a successful reconstruction.
    #[serde(default)]
    pub repair_corrupted_shards: bool,
}

impl ErasureCodingConfig {
    pub fn new(
        data_shards_count: usize,
        parity_shards_count: usize,
        base_folder_paths_across_drives: Vec<PathBuf>,
    ) -> Self {
        ErasureCodingConfig {
            data_shards_count,
            parity_shards_count,
            base_folder_paths_across_drives,
            repair_corrupted_shards: false,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards_count + self.parity_shards_count
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_shards_count == 0 {
            return Err(Error::invalid_config("erasure data shard count must be > 0"));
        }
        if self.parity_shards_count == 0 {
            return Err(Error::invalid_config(
                "erasure parity shard count must be > 0",
            ));
        }
        if self.base_folder_paths_across_drives.len() != self.total_shards() {
            return Err(Error::invalid_config(format!(
                "erasure config needs {} drive paths ({} data + {} parity), got {}",
                self.total_shards(),
                self.data_shards_count,
                self.parity_shards_count,
                self.base_folder_paths_across_drives.len()
            )));
        }
        Ok(())
    }
}

/// Distributed-cache endpoint. Either `url` or `address` identifies the
/// server; `url` wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

impl RedisCacheConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        RedisCacheConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    /// The connection URL handed to the redis client.
    pub fn connection_url(&self) -> Result<String> {
        if !self.url.is_empty() {
            return Ok(self.url.clone());
        }
        if self.address.is_empty() {
            return Err(Error::invalid_config(
                "redis_config requires url or address",
            ));
        }
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", self.password)
        };
        Ok(format!("redis://{}{}/{}", auth, self.address, self.db))
    }
}

fn default_registry_hash_mod() -> usize {
    MIN_REGISTRY_HASH_MOD
}

/// Database options as persisted in `dboptions.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// One entry (active) or two (active + passive replica).
    pub stores_folders: Vec<PathBuf>,
    /// Clustered-mode registry namespace.
    #[serde(default)]
    pub keyspace: Option<String>,
    /// Optional in standalone, required in clustered.
    #[serde(default)]
    pub redis_config: Option<RedisCacheConfig>,
    /// Store-name pattern to erasure parameters; `""` is the catch-all.
    #[serde(default)]
    pub erasure_config: Option<HashMap<String, ErasureCodingConfig>>,
    /// Registry bucket count, clamped to [250, 750000].
    #[serde(default = "default_registry_hash_mod")]
    pub registry_hash_mod: usize,
    /// Invented at setup and persisted; identifies this database in store
    /// records.
    #[serde(default)]
    pub database_id: Option<DatabaseId>,
}

impl DatabaseOptions {
    /// Standalone database over one active folder.
    pub fn standalone(folder: impl Into<PathBuf>) -> Self {
        DatabaseOptions {
            kind: DatabaseKind::Standalone,
            stores_folders: vec![folder.into()],
            keyspace: None,
            redis_config: None,
            erasure_config: None,
            registry_hash_mod: MIN_REGISTRY_HASH_MOD,
            database_id: None,
        }
    }

    pub fn active_folder(&self) -> &PathBuf {
        &self.stores_folders[0]
    }

    pub fn passive_folder(&self) -> Option<&PathBuf> {
        self.stores_folders.get(1)
    }

    /// Validate and fill defaults; the returned value is what `setup`
    /// persists and returns.
    pub fn effective(mut self) -> Result<Self> {
        match self.stores_folders.len() {
            1 | 2 => {}
            n => {
                return Err(Error::invalid_config(format!(
                    "stores_folders takes 1 (active) or 2 (active + passive) entries, got {}",
                    n
                )))
            }
        }
        if self.kind == DatabaseKind::Clustered {
            if self.redis_config.is_none() {
                return Err(Error::invalid_config(
                    "clustered databases require redis_config",
                ));
            }
            if self.keyspace.as_deref().unwrap_or("").is_empty() {
                return Err(Error::invalid_config("clustered databases require keyspace"));
            }
        }
        if let Some(erasure) = &self.erasure_config {
            for config in erasure.values() {
                config.validate()?;
            }
        }
        self.registry_hash_mod = self
            .registry_hash_mod
            .clamp(MIN_REGISTRY_HASH_MOD, MAX_REGISTRY_HASH_MOD);
        if self.database_id.is_none() {
            self.database_id = Some(DatabaseId::new());
        }
        Ok(self)
    }

    /// The erasure configuration applying to `store_name`: exact match
    /// first, then the `""` catch-all.
    pub fn erasure_for(&self, store_name: &str) -> Option<&ErasureCodingConfig> {
        let erasure = self.erasure_config.as_ref()?;
        erasure.get(store_name).or_else(|| erasure.get(""))
    }
}

/// Per-class cache policy carried by each store. Durations are minutes;
/// zero disables caching for the class. `is_*_ttl` selects sliding
/// expiration instead of absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub registry_cache_duration: u64,
    pub is_registry_cache_ttl: bool,
    pub node_cache_duration: u64,
    pub is_node_cache_ttl: bool,
    pub store_info_cache_duration: u64,
    pub is_store_info_cache_ttl: bool,
    pub value_data_cache_duration: u64,
    pub is_value_data_cache_ttl: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            registry_cache_duration: 10,
            is_registry_cache_ttl: false,
            node_cache_duration: 5,
            is_node_cache_ttl: false,
            store_info_cache_duration: 5,
            is_store_info_cache_ttl: false,
            value_data_cache_duration: 0,
            is_value_data_cache_ttl: false,
        }
    }
}

impl CacheConfig {
    fn duration(minutes: u64) -> Option<Duration> {
        (minutes > 0).then(|| Duration::from_secs(minutes * 60))
    }

    pub fn registry_ttl(&self) -> Option<Duration> {
        Self::duration(self.registry_cache_duration)
    }

    pub fn node_ttl(&self) -> Option<Duration> {
        Self::duration(self.node_cache_duration)
    }

    pub fn store_info_ttl(&self) -> Option<Duration> {
        Self::duration(self.store_info_cache_duration)
    }

    pub fn value_data_ttl(&self) -> Option<Duration> {
        Self::duration(self.value_data_cache_duration)
    }
}

/// Convenience presets mapping to the three value placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDataSize {
    /// In the node segment.
    Small,
    /// Own blob, globally cached.
    Medium,
    /// Own blob, actively persisted, not globally cached.
    Big,
}

/// Options for creating a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    pub slot_length: usize,
    pub is_unique: bool,
    /// False for composite (field-map) keys.
    pub is_primitive_key: bool,
    pub description: String,
    pub is_value_data_in_node_segment: bool,
    pub is_value_data_actively_persisted: bool,
    pub is_value_data_globally_cached: bool,
    #[serde(default)]
    pub cel_expression: String,
    pub cache_config: CacheConfig,
    pub leaf_load_balancing: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            slot_length: 500,
            is_unique: false,
            is_primitive_key: true,
            description: String::new(),
            is_value_data_in_node_segment: true,
            is_value_data_actively_persisted: false,
            is_value_data_globally_cached: false,
            cel_expression: String::new(),
            cache_config: CacheConfig::default(),
            leaf_load_balancing: false,
        }
    }
}

impl StoreOptions {
    /// Apply a size preset by rewriting the three placement flags.
    pub fn set_value_data_size(&mut self, size: ValueDataSize) {
        match size {
            ValueDataSize::Small => {
                self.is_value_data_in_node_segment = true;
                self.is_value_data_actively_persisted = false;
                self.is_value_data_globally_cached = false;
            }
            ValueDataSize::Medium => {
                self.is_value_data_in_node_segment = false;
                self.is_value_data_actively_persisted = false;
                self.is_value_data_globally_cached = true;
            }
            ValueDataSize::Big => {
                self.is_value_data_in_node_segment = false;
                self.is_value_data_actively_persisted = true;
                self.is_value_data_globally_cached = false;
            }
        }
    }

    /// Collapse the three flags into a placement; any other combination is
    /// rejected.
    pub fn value_placement(&self) -> Result<crate::store_info::ValuePlacement> {
        use crate::store_info::ValuePlacement::*;
        match (
            self.is_value_data_in_node_segment,
            self.is_value_data_actively_persisted,
            self.is_value_data_globally_cached,
        ) {
            (true, false, false) => Ok(InNode),
            (false, false, true) => Ok(SeparateCached),
            (false, true, false) => Ok(SeparatePersisted),
            other => Err(Error::invalid_config(format!(
                "value data flags {:?} do not name a placement; use a ValueDataSize preset",
                other
            ))),
        }
    }

    /// Slot length normalized to the supported range: at least 2, rounded
    /// up to even so splits always have a middle.
    pub fn effective_slot_length(&self) -> usize {
        let n = self.slot_length.max(2);
        n + (n % 2)
    }
}

/// Transaction commit-time validation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// No validation on commit; fastest, no ACID guarantee.
    NoCheck,
    /// Full optimistic validation for writers.
    ForWriting,
    /// Read-set version validation for snapshot-consistent readers.
    ForReading,
}

/// Default and maximum transaction lifetimes.
const DEFAULT_MAX_TIME_MINUTES: u64 = 15;
const CAP_MAX_TIME_MINUTES: u64 = 60;

/// Options for beginning a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub mode: TransactionMode,
    /// Minutes until the transaction self-aborts; 0 selects the default.
    #[serde(default)]
    pub max_time: u64,
    /// Write a commit sidecar log so crash leftovers can be reclaimed.
    #[serde(default)]
    pub logging: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        TransactionOptions {
            mode: TransactionMode::ForWriting,
            max_time: 0,
            logging: false,
        }
    }
}

impl TransactionOptions {
    pub fn writing() -> Self {
        TransactionOptions::default()
    }

    pub fn reading() -> Self {
        TransactionOptions {
            mode: TransactionMode::ForReading,
            ..Default::default()
        }
    }

    pub fn max_duration(&self) -> Duration {
        let minutes = match self.max_time {
            0 => DEFAULT_MAX_TIME_MINUTES,
            m => m.min(CAP_MAX_TIME_MINUTES),
        };
        Duration::from_secs(minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_mod_clamps_both_ways() {
        let mut opts = DatabaseOptions::standalone("/tmp/sop");
        opts.registry_hash_mod = 10;
        assert_eq!(
            opts.clone().effective().unwrap().registry_hash_mod,
            MIN_REGISTRY_HASH_MOD
        );
        opts.registry_hash_mod = 10_000_000;
        assert_eq!(
            opts.effective().unwrap().registry_hash_mod,
            MAX_REGISTRY_HASH_MOD
        );
    }

    #[test]
    fn folder_count_is_validated() {
        let mut opts = DatabaseOptions::standalone("/tmp/a");
        opts.stores_folders.push("/tmp/b".into());
        assert!(opts.clone().effective().is_ok());
        opts.stores_folders.push("/tmp/c".into());
        assert!(opts.effective().is_err());
    }

    #[test]
    fn clustered_requires_redis_and_keyspace() {
        let mut opts = DatabaseOptions::standalone("/tmp/a");
        opts.kind = DatabaseKind::Clustered;
        assert!(opts.clone().effective().is_err());
        opts.redis_config = Some(RedisCacheConfig::from_url("redis://127.0.0.1/"));
        assert!(opts.clone().effective().is_err());
        opts.keyspace = Some("sop".to_string());
        assert!(opts.effective().is_ok());
    }

    #[test]
    fn erasure_pattern_lookup_prefers_exact() {
        let mut opts = DatabaseOptions::standalone("/tmp/a");
        let catch_all = ErasureCodingConfig::new(2, 2, vec!["/d0".into(), "/d1".into(), "/d2".into(), "/d3".into()]);
        let exact = ErasureCodingConfig::new(1, 1, vec!["/e0".into(), "/e1".into()]);
        opts.erasure_config = Some(
            [("".to_string(), catch_all.clone()), ("big".to_string(), exact.clone())]
                .into_iter()
                .collect(),
        );
        assert_eq!(opts.erasure_for("big"), Some(&exact));
        assert_eq!(opts.erasure_for("other"), Some(&catch_all));
    }

    #[test]
    fn erasure_validation_checks_drive_count() {
        let bad = ErasureCodingConfig::new(2, 2, vec!["/only".into()]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn placement_flags_collapse() {
        use crate::store_info::ValuePlacement;
        let mut opts = StoreOptions::default();
        assert_eq!(opts.value_placement().unwrap(), ValuePlacement::InNode);
        opts.set_value_data_size(ValueDataSize::Medium);
        assert_eq!(opts.value_placement().unwrap(), ValuePlacement::SeparateCached);
        opts.set_value_data_size(ValueDataSize::Big);
        assert_eq!(
            opts.value_placement().unwrap(),
            ValuePlacement::SeparatePersisted
        );
        opts.is_value_data_globally_cached = true;
        assert!(opts.value_placement().is_err());
    }

    #[test]
    fn slot_length_normalizes() {
        let mut opts = StoreOptions::default();
        opts.slot_length = 0;
        assert_eq!(opts.effective_slot_length(), 2);
        opts.slot_length = 7;
        assert_eq!(opts.effective_slot_length(), 8);
        opts.slot_length = 500;
        assert_eq!(opts.effective_slot_length(), 500);
    }

    #[test]
    fn transaction_max_time_defaults_and_caps() {
        let mut opts = TransactionOptions::default();
        assert_eq!(opts.max_duration(), Duration::from_secs(15 * 60));
        opts.max_time = 5;
        assert_eq!(opts.max_duration(), Duration::from_secs(5 * 60));
        opts.max_time = 600;
        assert_eq!(opts.max_duration(), Duration::from_secs(60 * 60));
    }

    #[test]
    fn dboptions_json_round_trip() {
        let opts = DatabaseOptions::standalone("/tmp/sop").effective().unwrap();
        let json = serde_json::to_string_pretty(&opts).unwrap();
        assert!(json.contains("\"type\": \"standalone\""));
        let back: DatabaseOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }
}
