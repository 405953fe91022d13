//! Composite-key index specification and the store comparator.
//!
//! An index specification is an ordered list of `(field_name, ascending)`
//! entries; the induced comparator is the lexicographic composition of the
//! per-field orderings, with descending fields contributing inverted. A key
//! missing a named field sorts before any key that has it, so partially
//! populated keys still order deterministically.

use crate::cel::ComparatorExpression;
use crate::error::{Error, Result};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// One field of an index: which key field, and in which direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFieldSpecification {
    pub field_name: String,
    pub ascending_sort_order: bool,
}

impl IndexFieldSpecification {
    pub fn ascending(field_name: impl Into<String>) -> Self {
        IndexFieldSpecification {
            field_name: field_name.into(),
            ascending_sort_order: true,
        }
    }

    pub fn descending(field_name: impl Into<String>) -> Self {
        IndexFieldSpecification {
            field_name: field_name.into(),
            ascending_sort_order: false,
        }
    }
}

/// Ordered list of indexed fields deriving a total order for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpecification {
    pub index_fields: Vec<IndexFieldSpecification>,
}

impl IndexSpecification {
    pub fn new(index_fields: Vec<IndexFieldSpecification>) -> Self {
        IndexSpecification { index_fields }
    }

    /// Reject empty specs and repeated field names.
    pub fn validate(&self) -> Result<()> {
        if self.index_fields.is_empty() {
            return Err(Error::invalid_config(
                "index specification must name at least one field",
            ));
        }
        let mut seen = HashSet::new();
        for field in &self.index_fields {
            if field.field_name.is_empty() {
                return Err(Error::invalid_config("index field name must not be empty"));
            }
            if !seen.insert(field.field_name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "index field {:?} listed twice",
                    field.field_name
                )));
            }
        }
        Ok(())
    }

    /// Compare two keys under this specification. Non-composite keys fall
    /// back to the natural order, which keeps the comparator total even if a
    /// caller smuggles a primitive key into a composite store.
    pub fn compare(&self, x: &Key, y: &Key) -> Ordering {
        if !x.is_composite() || !y.is_composite() {
            return x.natural_cmp(y);
        }
        for field in &self.index_fields {
            let ord = match (x.field(&field.field_name), y.field(&field.field_name)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            };
            let ord = if field.ascending_sort_order {
                ord
            } else {
                ord.reverse()
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// The comparator a store actually sorts with.
///
/// Priority: index specification, then comparator expression, then the
/// natural key order. When both an index spec and an expression are present
/// the spec wins and the expression is never evaluated.
#[derive(Debug, Clone, Default)]
pub struct KeyComparator {
    index: Option<IndexSpecification>,
    expression: Option<ComparatorExpression>,
}

impl KeyComparator {
    /// Natural ordering only.
    pub fn natural() -> Self {
        KeyComparator::default()
    }

    pub fn new(
        index: Option<IndexSpecification>,
        expression: Option<ComparatorExpression>,
    ) -> Self {
        KeyComparator { index, expression }
    }

    pub fn with_index(index: IndexSpecification) -> Self {
        KeyComparator {
            index: Some(index),
            expression: None,
        }
    }

    pub fn with_expression(expression: ComparatorExpression) -> Self {
        KeyComparator {
            index: None,
            expression: Some(expression),
        }
    }

    pub fn compare(&self, x: &Key, y: &Key) -> Ordering {
        if let Some(spec) = &self.index {
            return spec.compare(x, y);
        }
        if let Some(expr) = &self.expression {
            if let (Key::Composite(a), Key::Composite(b)) = (x, y) {
                return expr.compare(a, b);
            }
        }
        x.natural_cmp(y)
    }
}
