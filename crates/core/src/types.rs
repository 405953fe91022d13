//! Identifier newtypes and the registry handle.
//!
//! Every identity in SOP is a UUID v4 behind a newtype so the compiler keeps
//! store, transaction, item, logical and segment ids from being mixed up.
//! `LogicalId` names a B-tree node across rewrites; `SegmentId` addresses one
//! immutable blob in the blob store; the registry maps the former to the
//! latter plus a version.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil id, used as a sentinel in persistent records.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Rebuild an id from raw bytes.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Parse from the standard UUID string form.
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Raw bytes of the id.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Identity of a database (one options file, one registry).
    DatabaseId
}

uuid_id! {
    /// Internal identity of a store, stable across renames of nothing
    /// (store names are immutable); used to address the store-info record
    /// and the store root lock.
    StoreId
}

uuid_id! {
    /// Identity of one transaction.
    TransactionId
}

uuid_id! {
    /// Identity of one item, stable across updates. Disambiguates duplicate
    /// keys in non-unique stores.
    ItemId
}

uuid_id! {
    /// Tree-internal node identity, stable across node rewrites.
    LogicalId
}

uuid_id! {
    /// Address of one immutable blob segment.
    SegmentId
}

/// A resolved registry mapping: where a logical node currently lives and at
/// which version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    /// The stable node identity.
    pub logical_id: LogicalId,
    /// The segment holding the current version's bytes.
    pub segment_id: SegmentId,
    /// Monotonically advancing version, bumped by every rewrite.
    pub version: u64,
}

impl Handle {
    pub fn new(logical_id: LogicalId, segment_id: SegmentId, version: u64) -> Self {
        Handle {
            logical_id,
            segment_id,
            version,
        }
    }

    /// The handle a brand-new node gets before its first publish.
    pub fn initial(logical_id: LogicalId, segment_id: SegmentId) -> Self {
        Handle::new(logical_id, segment_id, 1)
    }

    /// The successor handle produced by rewriting this node into `segment_id`.
    pub fn next(&self, segment_id: SegmentId) -> Self {
        Handle::new(self.logical_id, segment_id, self.version + 1)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@v{}->{}",
            self.logical_id, self.version, self.segment_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_parse() {
        let a = LogicalId::new();
        let b = LogicalId::new();
        assert_ne!(a, b);
        let parsed = LogicalId::from_string(&a.to_string()).unwrap();
        assert_eq!(a, parsed);
        assert!(LogicalId::from_string("not-a-uuid").is_none());
    }

    #[test]
    fn nil_is_sentinel() {
        assert!(SegmentId::nil().is_nil());
        assert!(!SegmentId::new().is_nil());
    }

    #[test]
    fn handle_versions_advance() {
        let h = Handle::initial(LogicalId::new(), SegmentId::new());
        assert_eq!(h.version, 1);
        let h2 = h.next(SegmentId::new());
        assert_eq!(h2.version, 2);
        assert_eq!(h2.logical_id, h.logical_id);
        assert_ne!(h2.segment_id, h.segment_id);
    }

    #[test]
    fn handle_serde_round_trip() {
        let h = Handle::initial(LogicalId::new(), SegmentId::new());
        let bytes = bincode::serialize(&h).unwrap();
        let back: Handle = bincode::deserialize(&bytes).unwrap();
        assert_eq!(h, back);
    }
}
