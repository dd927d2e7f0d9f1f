use thiserror::Error;

use crate::types::BlobId;

/// Errors reported by a single backend command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The command was a write and reached a read-only replica.
    #[error("read-only replica: {0}")]
    ReadOnly(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_read_only(&self) -> bool {
        matches!(self, BackendError::ReadOnly(_))
    }

    /// Timeouts and resets are worth another attempt, everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Connection(_))
    }
}

/// Errors surfaced by the blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Every cluster endpoint reports the replica role.
    #[error("no writable node in the cluster")]
    NoWritableNode,

    #[error("cluster backend unreachable after {attempts} attempts: {source}")]
    BackendUnavailable {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// Transient failures kept happening until the retry budget ran out.
    #[error("backend error after {attempts} attempts: {source}")]
    TransientExhausted {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("write reached a read-only replica: {0}")]
    ReadOnlyReplica(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("file {0} not found")]
    FileNotFound(BlobId),

    #[error("invalid metadata for {blob_id}: {reason}")]
    InvalidMetadata { blob_id: BlobId, reason: String },

    #[error("corrupt file {blob_id} at offset {offset}: {reason}")]
    CorruptFile {
        blob_id: BlobId,
        offset: u64,
        reason: String,
    },

    #[error("storing {blob_id} failed: {source}")]
    StorageWriteFailed {
        blob_id: BlobId,
        #[source]
        source: Box<BlobError>,
    },

    #[error("invalid blob id {0}")]
    InvalidBlobId(String),

    #[error("invalid extension '{0}'")]
    InvalidExtension(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Converts a backend failure that came out of a write path.
    pub(crate) fn from_write(err: BackendError) -> Self {
        match err {
            BackendError::ReadOnly(msg) => BlobError::ReadOnlyReplica(msg),
            other => BlobError::Backend(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::FileNotFound(_))
    }
}
