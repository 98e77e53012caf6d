//! Error types for the node.

use crate::network::NetworkError;
use crate::node::NodeState;
use serde_json::Value;
use swarm_log::{Hash, LogError, StoreError};
use thiserror::Error;

/// Error type for node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed command input.
    #[error("validation failed: {context}")]
    Validation { context: String, details: Value },

    /// Read, update or delete on an absent key.
    #[error("document not found: {key}")]
    NotFound { key: String },

    /// Update with the value already stored.
    #[error("data already up to date: {key}")]
    NoChange { key: String, doc: Value },

    /// Access policy denial.
    #[error("write rejected for {author} on key {key:?}")]
    WriteRejected { author: String, key: String },

    /// Entry whose predecessors never arrived.
    #[error("orphan entry {} dropped", .0.short())]
    OrphanEntry(Hash),

    /// Transport-level failure during a sync session.
    #[error("sync with {peer} failed: {reason}")]
    PeerSyncFailure { peer: String, reason: String },

    /// Signature or DAG integrity violation.
    #[error("malformed entry {}: {reason}", .hash.short())]
    MalformedEntry { hash: Hash, reason: String },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The local store failed. Not recoverable.
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("node is {0}, not ready")]
    NotReady(NodeState),
}

/// Stable name of an error variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    NoChange,
    WriteRejected,
    OrphanEntry,
    PeerSyncFailure,
    MalformedEntry,
    Network,
    Serialization,
    Storage,
    NotReady,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::NoChange => "NoChange",
            ErrorKind::WriteRejected => "WriteRejected",
            ErrorKind::OrphanEntry => "OrphanEntry",
            ErrorKind::PeerSyncFailure => "PeerSyncFailure",
            ErrorKind::MalformedEntry => "MalformedEntry",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Serialization => "SerializationError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::NotReady => "NotReady",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Validation { .. } => ErrorKind::Validation,
            NodeError::NotFound { .. } => ErrorKind::NotFound,
            NodeError::NoChange { .. } => ErrorKind::NoChange,
            NodeError::WriteRejected { .. } => ErrorKind::WriteRejected,
            NodeError::OrphanEntry(_) => ErrorKind::OrphanEntry,
            NodeError::PeerSyncFailure { .. } => ErrorKind::PeerSyncFailure,
            NodeError::MalformedEntry { .. } => ErrorKind::MalformedEntry,
            NodeError::Network(_) => ErrorKind::Network,
            NodeError::Serialization(_) => ErrorKind::Serialization,
            NodeError::Storage(_) => ErrorKind::Storage,
            NodeError::NotReady(_) => ErrorKind::NotReady,
        }
    }

    /// Whether the process should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Storage(_))
    }

    pub fn validation(context: impl Into<String>, details: Value) -> Self {
        NodeError::Validation {
            context: context.into(),
            details,
        }
    }

    pub fn sync_failure(peer: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        NodeError::PeerSyncFailure {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<LogError> for NodeError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::WriteRejected { author, key } => NodeError::WriteRejected { author, key },
            LogError::MalformedEntry { hash, reason } => NodeError::MalformedEntry {
                hash,
                reason: reason.to_string(),
            },
            LogError::OrphanEntry(hash) => NodeError::OrphanEntry(hash),
            LogError::Store(StoreError::VerificationFailed(hash, fault)) => NodeError::MalformedEntry {
                hash,
                reason: fault.to_string(),
            },
            LogError::Store(StoreError::MissingParents(missing)) => match missing.first() {
                Some(hash) => NodeError::OrphanEntry(*hash),
                None => NodeError::Storage("missing predecessors".into()),
            },
            LogError::Store(StoreError::Backend(reason)) => NodeError::Storage(reason),
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_errors_map_to_kinds() {
        let rejected: NodeError = LogError::WriteRejected {
            author: "a".into(),
            key: "k".into(),
        }
        .into();
        assert_eq!(rejected.kind(), ErrorKind::WriteRejected);
        assert!(!rejected.is_fatal());

        let backend: NodeError = LogError::Store(StoreError::Backend("disk gone".into())).into();
        assert_eq!(backend.kind(), ErrorKind::Storage);
        assert!(backend.is_fatal());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::Validation.to_string(), "ValidationError");
        assert_eq!(
            NodeError::NotFound { key: "x".into() }.kind().as_str(),
            "NotFound"
        );
    }
}
