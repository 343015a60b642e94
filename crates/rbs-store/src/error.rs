use rbs_types::BlobId;

use crate::stream::StreamId;

/// One stream that could not be closed during a bulk teardown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCloseFailure {
    pub stream: StreamId,
    pub reason: String,
}

/// Errors from blob store operations, local or bridged.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store does not support the requested mode (e.g. transactions).
    ///
    /// Callers branch on this to fall back to non-transactional use, so it is
    /// never folded into a generic I/O failure.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("blob not found: {0}")]
    NotFound(BlobId),

    #[error("blob already exists: {0}")]
    AlreadyExists(BlobId),

    #[error("connection is closed")]
    Closed,

    /// Writes are paused while the store is quiescent.
    #[error("store is quiescent")]
    Quiescent,

    #[error("transaction error: {0}")]
    Transaction(String),

    /// Some streams failed to close during a bulk teardown. The sweep still
    /// visited every stream.
    #[error("{} stream(s) failed to close", .0.len())]
    PartialTeardown(Vec<StreamCloseFailure>),

    /// The remote peer could not be reached.
    #[error("{op} on {target}: peer unreachable: {reason}")]
    Unreachable {
        op: &'static str,
        target: String,
        reason: String,
    },

    /// The transport gave up waiting for the remote peer.
    #[error("{op} on {target}: timed out")]
    TimedOut { op: &'static str, target: String },

    /// The remote peer reported an I/O failure of its own.
    #[error("{op} on {target} failed remotely: {message}")]
    Remote {
        op: &'static str,
        target: String,
        message: String,
    },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Connectivity failures: the operation may not have reached the peer.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::TimedOut { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
