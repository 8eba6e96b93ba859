//! Store error types.

use calbridge_core::{EntityKind, UnknownKind};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The transaction was opened without this kind.
    #[error("{0} is not covered by this transaction")]
    KindNotInScope(EntityKind),

    #[error("cannot write in a read-only transaction")]
    ReadOnly,

    /// The factory has no constructor for this kind.
    #[error("no store registered for {0}")]
    UnregisteredKind(EntityKind),

    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),

    /// A cached store is not of the requested record type.
    #[error("store for {0} has an unexpected record type")]
    TypeMismatch(EntityKind),

    #[error("{kind} record {id} could not be decoded: {source}")]
    Decode {
        kind: EntityKind,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("snapshot write failed: {0}")]
    Flush(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
