//! Store metadata: the record describing one B-tree store's schema, policy
//! and published counters.
//!
//! Structural fields (`key_kind`, `slot_length`, `is_unique`,
//! `value_placement`, the index spec) freeze once the store holds data;
//! the comparator expression may still change while no index spec exists or
//! the store is empty. Counters (`item_count`, `root_node`, `version`) are
//! rewritten by every committing transaction that touches the store.

use crate::cel::ComparatorExpression;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::index::{IndexSpecification, KeyComparator};
use crate::types::{DatabaseId, Handle, StoreId};
use serde::{Deserialize, Serialize};

/// Whether keys are primitive values or composite field maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Primitive,
    Composite,
}

/// Where a slot's value bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuePlacement {
    /// Serialized inside the node segment; cached with the node.
    InNode,
    /// Own blob segment, written at commit, globally cached.
    SeparateCached,
    /// Own blob segment, written while the operation runs, never globally
    /// cached. For values large enough that deferring them to commit would
    /// balloon the commit window.
    SeparatePersisted,
}

/// The persistent description of one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInfo {
    pub database_id: DatabaseId,
    pub store_name: String,
    /// Internal identity; addresses the store-info registry entry and the
    /// store root lock.
    pub store_uuid: StoreId,
    pub description: String,

    pub key_kind: KeyKind,
    pub index_spec: Option<IndexSpecification>,
    /// Comparator expression source; parsed on open, advisory when an index
    /// spec exists.
    pub cel_expression: Option<String>,

    pub slot_length: usize,
    pub is_unique: bool,
    pub value_placement: ValuePlacement,
    pub leaf_load_balancing: bool,

    pub cache_config: CacheConfig,

    /// Number of reachable leaf slots at the published root.
    pub item_count: u64,
    /// Published root, absent while the tree is empty.
    pub root_node: Option<Handle>,
    /// Bumped on every publish of this record.
    pub version: u64,
}

impl StoreInfo {
    /// Build the comparator this store sorts with. Parsing the expression
    /// here means a corrupt persisted expression surfaces at open, not in
    /// the middle of an insert.
    pub fn comparator(&self) -> Result<KeyComparator> {
        let expression = match &self.cel_expression {
            Some(src) if !src.is_empty() => Some(ComparatorExpression::parse(src)?),
            _ => None,
        };
        Ok(KeyComparator::new(self.index_spec.clone(), expression))
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    /// Enforce structural immutability against a proposed replacement.
    /// Callers apply this before accepting changed store options for an
    /// existing store.
    pub fn ensure_structural_match(&self, other: &StoreInfo) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let frozen = [
            ("key_kind", self.key_kind != other.key_kind),
            ("slot_length", self.slot_length != other.slot_length),
            ("is_unique", self.is_unique != other.is_unique),
            (
                "value_placement",
                self.value_placement != other.value_placement,
            ),
            ("index_spec", self.index_spec != other.index_spec),
        ];
        for (field, changed) in frozen {
            if changed {
                return Err(Error::precondition_failed(format!(
                    "store {:?} is populated; {} cannot change",
                    self.store_name, field
                )));
            }
        }
        Ok(())
    }

    /// The comparator expression may change only while no index spec exists
    /// or the store is empty.
    pub fn ensure_expression_change_allowed(&self, new_expression: Option<&str>) -> Result<()> {
        let changing = match (&self.cel_expression, new_expression) {
            (Some(a), Some(b)) => a != b,
            (None, None) => false,
            _ => true,
        };
        if changing && self.index_spec.is_some() && !self.is_empty() {
            return Err(Error::precondition_failed(format!(
                "store {:?} has an index specification and data; comparator expression is frozen",
                self.store_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexFieldSpecification;

    fn base() -> StoreInfo {
        StoreInfo {
            database_id: DatabaseId::new(),
            store_name: "users".to_string(),
            store_uuid: StoreId::new(),
            description: String::new(),
            key_kind: KeyKind::Primitive,
            index_spec: None,
            cel_expression: None,
            slot_length: 500,
            is_unique: true,
            value_placement: ValuePlacement::InNode,
            leaf_load_balancing: false,
            cache_config: CacheConfig::default(),
            item_count: 0,
            root_node: None,
            version: 0,
        }
    }

    #[test]
    fn empty_store_accepts_structural_change() {
        let a = base();
        let mut b = a.clone();
        b.slot_length = 100;
        assert!(a.ensure_structural_match(&b).is_ok());
    }

    #[test]
    fn populated_store_freezes_structure() {
        let mut a = base();
        a.item_count = 3;
        let mut b = a.clone();
        b.is_unique = false;
        let err = a.ensure_structural_match(&b).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("is_unique"));
    }

    #[test]
    fn expression_frozen_only_with_index_and_data() {
        let mut info = base();
        info.cel_expression = Some("mapX.a < mapY.a ? -1 : 1".to_string());
        // No index spec: change allowed even when populated.
        info.item_count = 5;
        assert!(info.ensure_expression_change_allowed(Some("0")).is_ok());

        info.index_spec = Some(IndexSpecification::new(vec![
            IndexFieldSpecification::ascending("a"),
        ]));
        assert!(info.ensure_expression_change_allowed(Some("0")).is_err());
        // Unchanged expression is fine.
        assert!(info
            .ensure_expression_change_allowed(Some("mapX.a < mapY.a ? -1 : 1"))
            .is_ok());
    }

    #[test]
    fn comparator_rejects_bad_persisted_expression() {
        let mut info = base();
        info.cel_expression = Some("not an expression".to_string());
        assert!(info.comparator().is_err());
    }
}
