//! Error types shared across the sync engine and the relay.

use crate::document::ContainerKind;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Umbrella error for engine and relay operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The CRDT library rejected an operation or an encoding.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A key was already bound to a container of another kind.
    #[error("key {key} is a {existing:?} container, not {requested:?}")]
    KindMismatch {
        key: String,
        existing: ContainerKind,
        requested: ContainerKind,
    },

    /// A live key was requested with a different adapter type.
    #[error("key {key} is bound as {existing}, not {requested}")]
    BindingMismatch {
        key: String,
        existing: String,
        requested: String,
    },

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    /// A value did not have the shape an adapter expects.
    #[error("unexpected value for {key}: expected {expected}")]
    Shape { key: String, expected: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub(crate) fn crdt(err: impl std::fmt::Display) -> Self {
        SyncError::Crdt(err.to_string())
    }
}
