use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BlobError;

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Largest chunk a store writes or a reader accepts from metadata.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

const FIELD_EXTENSION: &str = "extension";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_SIZE_BYTES: &str = "size_bytes";
const FIELD_CHUNK_SIZE: &str = "chunk_size";

/// Opaque identifier of a stored blob, minted once per store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(Uuid);

impl BlobId {
    /// Mints a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for BlobId {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| BlobError::InvalidBlobId(format!("{s}: {e}")))
    }
}

/// Side record describing a blob.
///
/// `size_bytes` is only set once every chunk has been written; until then
/// the blob is in progress (or abandoned) and must not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub blob_id: BlobId,
    pub extension: String,
    pub created_at: DateTime<Utc>,
    /// Chunk size used by the writer; absent on records from older writers.
    pub chunk_size: Option<u64>,
    pub size_bytes: Option<u64>,
}

impl FileMetadata {
    pub fn new(
        blob_id: BlobId,
        extension: impl Into<String>,
        created_at: DateTime<Utc>,
        chunk_size: usize,
    ) -> Self {
        Self {
            blob_id,
            extension: extension.into(),
            created_at,
            chunk_size: Some(chunk_size as u64),
            size_bytes: None,
        }
    }

    /// True once the writer has recorded the final size.
    pub fn is_complete(&self) -> bool {
        self.size_bytes.is_some()
    }

    /// Hash fields written when the blob is started. The size is left out on purpose.
    pub fn initial_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_EXTENSION.to_string(), self.extension.clone()),
            (FIELD_CREATED_AT.to_string(), self.created_at.to_rfc3339()),
        ];
        if let Some(chunk_size) = self.chunk_size {
            fields.push((FIELD_CHUNK_SIZE.to_string(), chunk_size.to_string()));
        }
        fields
    }

    /// Hash field marking the blob as complete.
    pub fn completion_field(size_bytes: u64) -> (String, String) {
        (FIELD_SIZE_BYTES.to_string(), size_bytes.to_string())
    }

    /// Rebuilds metadata from the hash fields of the metadata record.
    pub fn from_fields(blob_id: BlobId, fields: &HashMap<String, String>) -> Result<Self, BlobError> {
        let invalid = |reason: String| BlobError::InvalidMetadata { blob_id, reason };

        let extension = fields.get(FIELD_EXTENSION).cloned().unwrap_or_default();
        let created_at = match fields.get(FIELD_CREATED_AT) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| invalid(format!("bad {FIELD_CREATED_AT} '{raw}': {e}")))?
                .with_timezone(&Utc),
            None => return Err(invalid(format!("missing {FIELD_CREATED_AT}"))),
        };
        let parse_u64 = |name: &str| -> Result<Option<u64>, BlobError> {
            fields
                .get(name)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map_err(|e| invalid(format!("bad {name} '{raw}': {e}")))
                })
                .transpose()
        };
        let chunk_size = parse_u64(FIELD_CHUNK_SIZE)?.filter(|size| *size > 0);
        let size_bytes = parse_u64(FIELD_SIZE_BYTES)?;

        Ok(Self {
            blob_id,
            extension,
            created_at,
            chunk_size,
            size_bytes,
        })
    }
}

/// Start offsets of every chunk of a blob of `size_bytes` bytes.
pub fn chunk_offsets(size_bytes: u64, chunk_size: usize) -> impl Iterator<Item = u64> {
    let step = chunk_size.max(1) as u64;
    (0..size_bytes.div_ceil(step)).map(move |i| i * step)
}

/// Fully materialized blob returned by a retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedBlob {
    pub data: Bytes,
    pub extension: String,
}

impl RetrievedBlob {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Readable view over the content (`Cursor` implements `AsyncRead`).
    pub fn into_reader(self) -> Cursor<Bytes> {
        Cursor::new(self.data)
    }
}
