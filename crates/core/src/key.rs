//! Key and value payload model.
//!
//! Keys are either primitive (string, integer, float, raw bytes) or composite
//! (a named-field map). Both forms carry a total "natural" order so a store
//! without an index specification still iterates deterministically. Floats
//! order by `f64::total_cmp`, which gives NaN a fixed place instead of
//! poisoning comparisons.
//!
//! Values are opaque byte buffers; callers serialize their own payloads and
//! the engine only decides *where* the bytes live (see value placement).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// One field of a composite key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Rank used to order values of different runtime types. Mixed-type
    /// fields are legal in schema-less composite stores, so the order must
    /// stay total.
    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Integer(_) => 1,
            FieldValue::Float(_) => 2,
            FieldValue::String(_) => 3,
        }
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use FieldValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            // Numeric cross-type comparison keeps 1 and 1.0 adjacent.
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// A store key: primitive or composite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    String(String),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    /// Named fields; iteration order (and thus natural ordering) follows the
    /// sorted field names.
    Composite(BTreeMap<String, FieldValue>),
}

impl Key {
    /// Build a composite key from `(field, value)` pairs.
    pub fn composite<I, S, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<FieldValue>,
    {
        Key::Composite(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Key::Composite(_))
    }

    /// Field lookup on a composite key; `None` for primitives and missing
    /// fields alike.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        match self {
            Key::Composite(fields) => fields.get(name),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::String(_) => 0,
            Key::Integer(_) => 1,
            Key::Float(_) => 2,
            Key::Bytes(_) => 3,
            Key::Composite(_) => 4,
        }
    }

    /// The natural total order: used directly for primitive stores and as
    /// the fallback for composite stores without an index specification.
    pub fn natural_cmp(&self, other: &Self) -> Ordering {
        use Key::*;
        match (self, other) {
            (String(a), String(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Composite(a), Composite(b)) => a
                .iter()
                .map(|(k, v)| (k, v))
                .cmp(b.iter().map(|(k, v)| (k, v))),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.natural_cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::String(s) => write!(f, "{:?}", s),
            Key::Integer(i) => write!(f, "{}", i),
            Key::Float(x) => write!(f, "{}", x),
            Key::Bytes(b) => write!(f, "0x{}", hex_prefix(b)),
            Key::Composite(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Integer(v)
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_is_total_over_types() {
        let keys = vec![
            Key::from("b"),
            Key::from(3i64),
            Key::Float(2.5),
            Key::from(vec![0u8, 1]),
            Key::composite([("a", 1i64)]),
        ];
        for a in &keys {
            assert_eq!(a.natural_cmp(a), Ordering::Equal);
            for b in &keys {
                let ab = a.natural_cmp(b);
                let ba = b.natural_cmp(a);
                assert_eq!(ab, ba.reverse());
            }
        }
    }

    #[test]
    fn float_nan_has_a_fixed_place() {
        let nan = Key::Float(f64::NAN);
        assert_eq!(nan.natural_cmp(&nan), Ordering::Equal);
        assert_ne!(nan.natural_cmp(&Key::Float(0.0)), Ordering::Equal);
    }

    #[test]
    fn composite_orders_by_field_name_then_value() {
        let a = Key::composite([("region", "EU"), ("dept", "Eng")]);
        let b = Key::composite([("region", "US"), ("dept", "Eng")]);
        // BTreeMap iterates dept before region, so dept ties break on region.
        assert_eq!(a.natural_cmp(&b), Ordering::Less);
    }

    #[test]
    fn field_access() {
        let k = Key::composite([("id", 42i64)]);
        assert_eq!(k.field("id"), Some(&FieldValue::Integer(42)));
        assert_eq!(k.field("missing"), None);
        assert_eq!(Key::from("x").field("id"), None);
    }

    #[test]
    fn serde_round_trip_preserves_order() {
        let k = Key::composite([("region", "US"), ("employee_id", 101i64)]);
        let bytes = bincode::serialize(&k).unwrap();
        let back: Key = bincode::deserialize(&bytes).unwrap();
        assert_eq!(k, back);
    }
}
