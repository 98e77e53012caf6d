//! Error types for the operation log.

use crate::entry::EntryFault;
use crate::hash::Hash;
use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by [`OpLog`](crate::OpLog) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("write rejected for {author} on key {key:?}")]
    WriteRejected { author: String, key: String },

    #[error("malformed entry {}: {reason}", .hash.short())]
    MalformedEntry { hash: Hash, reason: EntryFault },

    #[error("orphan entry {} dropped: predecessors never arrived", .0.short())]
    OrphanEntry(Hash),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LogError {
    /// Whether the local store can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Store(StoreError::Backend(_)))
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
