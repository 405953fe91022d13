//! Error types shared by every SOP crate.
//!
//! One unified enum, `Error`, is carried through the whole engine via the
//! `Result<T>` alias. Variants fall into four groups that callers dispatch on:
//!
//! - **User errors**: `NotFound`, `Duplicate`, `InvalidState`, `InvalidConfig`,
//!   `PreconditionFailed` — reported straight back to the caller.
//! - **Retryable**: `ConflictRetryable`, `LockTimeout`, `Canceled` — the caller
//!   may re-run its transaction logic.
//! - **Environmental**: `Io`, `Timeout` — retried within a bounded budget
//!   inside a single call, then surfaced.
//! - **Fatal**: `DataLoss`, `Internal` — surfaced immediately; no further
//!   writes should be attempted until an operator intervenes.
//!
//! The transaction manager wraps failures it propagates in `Commit`, which
//! carries the transaction id and the commit phase that failed.

use crate::types::{LogicalId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias used across all SOP crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Phases of the two-phase commit protocol, used for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPhase {
    /// Flushing actively-persisted value blobs.
    Freeze,
    /// Acquiring distributed locks on the write set.
    Lock,
    /// Re-reading registry versions against the read set.
    Validate,
    /// Persisting staged node and value segments.
    WriteBlobs,
    /// The registry CAS that publishes the new versions.
    Publish,
    /// Cache invalidation and lock release.
    Finalize,
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitPhase::Freeze => "freeze",
            CommitPhase::Lock => "lock",
            CommitPhase::Validate => "validate",
            CommitPhase::WriteBlobs => "write-blobs",
            CommitPhase::Publish => "publish",
            CommitPhase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Unified error type for all SOP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested item, store, or segment does not exist.
    #[error("not found: {detail}")]
    NotFound {
        /// What was looked up and missed.
        detail: String,
    },

    /// Insert rejected because the key already exists in a unique store.
    ///
    /// `index` is the position of the offending entry within the batch the
    /// caller submitted (0 for single-item calls).
    #[error("duplicate key at batch index {index}: {detail}")]
    Duplicate {
        /// Batch position of the first offending entry.
        index: usize,
        /// The offending key, rendered.
        detail: String,
    },

    /// Operation attempted against a handle or transaction in the wrong state.
    #[error("invalid state: {detail}")]
    InvalidState {
        /// What state was required and what was found.
        detail: String,
    },

    /// Configuration rejected before any work was attempted.
    #[error("invalid configuration: {detail}")]
    InvalidConfig {
        /// Which field or combination is invalid.
        detail: String,
    },

    /// A structural rule was violated, e.g. changing the index spec of a
    /// populated store.
    #[error("precondition failed: {detail}")]
    PreconditionFailed {
        /// The violated rule.
        detail: String,
    },

    /// Optimistic validation failed at commit: the read set changed under
    /// this transaction. The caller is expected to re-run its logic.
    #[error("commit conflict on {logical_ids:?}")]
    ConflictRetryable {
        /// Registry entries whose versions diverged from the snapshot.
        logical_ids: Vec<LogicalId>,
    },

    /// Bounded lock-acquisition retry was exhausted.
    #[error("lock acquisition timed out on {key}")]
    LockTimeout {
        /// The lock key that could not be acquired.
        key: String,
    },

    /// The transaction deadline elapsed.
    #[error("transaction deadline exceeded")]
    Timeout,

    /// The carried `Context` was canceled.
    #[error("operation canceled")]
    Canceled,

    /// Filesystem or network failure. Retryable within a bounded budget.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a persistent record failed.
    #[error("serialization failure: {detail}")]
    Serialization {
        /// What failed to round-trip.
        detail: String,
    },

    /// Too few valid replicas or shards remain to reconstruct the payload.
    #[error("data loss: {detail}")]
    DataLoss {
        /// Which segment is unrecoverable and why.
        detail: String,
    },

    /// An engine invariant was violated. Indicates a bug.
    #[error("internal error: {detail}")]
    Internal {
        /// The violated invariant.
        detail: String,
    },

    /// A commit-path failure, wrapped with transaction and phase context.
    #[error("commit failed (tx {tx_id}, phase {phase}): {source}")]
    Commit {
        /// The committing transaction.
        tx_id: TransactionId,
        /// The phase that failed.
        phase: CommitPhase,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(detail: impl Into<String>) -> Self {
        Error::NotFound {
            detail: detail.into(),
        }
    }

    pub fn duplicate(index: usize, detail: impl Into<String>) -> Self {
        Error::Duplicate {
            index,
            detail: detail.into(),
        }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Error::InvalidState {
            detail: detail.into(),
        }
    }

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Error::InvalidConfig {
            detail: detail.into(),
        }
    }

    pub fn precondition_failed(detail: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            detail: detail.into(),
        }
    }

    pub fn conflict(logical_ids: Vec<LogicalId>) -> Self {
        Error::ConflictRetryable { logical_ids }
    }

    pub fn lock_timeout(key: impl Into<String>) -> Self {
        Error::LockTimeout { key: key.into() }
    }

    pub fn serialization(detail: impl Into<String>) -> Self {
        Error::Serialization {
            detail: detail.into(),
        }
    }

    pub fn data_loss(detail: impl Into<String>) -> Self {
        Error::DataLoss {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Error::Internal {
            detail: detail.into(),
        }
    }

    /// Wrap this error with commit context.
    pub fn in_commit_phase(self, tx_id: TransactionId, phase: CommitPhase) -> Self {
        // Avoid stacking commit wrappers when an inner phase already tagged.
        if matches!(self, Error::Commit { .. }) {
            return self;
        }
        Error::Commit {
            tx_id,
            phase,
            source: Box::new(self),
        }
    }

    /// Strip the commit wrapper, if any, and return the root failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::Commit { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors reported straight to the caller as its own mistake.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.root(),
            Error::NotFound { .. }
                | Error::Duplicate { .. }
                | Error::InvalidState { .. }
                | Error::InvalidConfig { .. }
                | Error::PreconditionFailed { .. }
        )
    }

    /// Errors after which the caller may re-run its transaction logic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::ConflictRetryable { .. } | Error::LockTimeout { .. } | Error::Canceled
        )
    }

    /// True when the read set diverged and a re-run would see fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::ConflictRetryable { .. })
    }

    /// Transient infrastructure failures, retried within one call.
    pub fn is_environmental(&self) -> bool {
        matches!(self.root(), Error::Io(_) | Error::Timeout)
    }

    /// Unrecoverable failures; stop writing and page an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Error::DataLoss { .. } | Error::Internal { .. })
    }

    /// The registry entries a conflict was detected on, when applicable.
    pub fn offending_ids(&self) -> Option<&[LogicalId]> {
        match self.root() {
            Error::ConflictRetryable { logical_ids } => Some(logical_ids),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization {
            detail: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            detail: format!("json: {}", e),
        }
    }
}
