//! Reassembly of chunked blobs.

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BlobError;
use crate::retry::retry;
use crate::store::Context;
use crate::types::{chunk_offsets, BlobId, FileMetadata, RetrievedBlob, MAX_CHUNK_SIZE};

pub struct ChunkedReader {
    ctx: Context,
}

impl ChunkedReader {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Reads the metadata record, then every chunk in offset order.
    ///
    /// A blob whose metadata has no size is still being written (or was
    /// abandoned) and is reported as invalid rather than returned partially.
    pub async fn retrieve(
        &self,
        blob_id: &BlobId,
        cancel: &CancellationToken,
    ) -> Result<RetrievedBlob, BlobError> {
        let Some(node) = self.ctx.supervisor.acquire_readable_node(cancel).await? else {
            return Err(BlobError::FileNotFound(*blob_id));
        };
        let policy = &self.ctx.settings.read_retry;
        let clock = self.ctx.clock.as_ref();

        let meta_key = self.ctx.keys.metadata_key(blob_id);
        let fields = retry(policy, clock, cancel, "metadata read", || node.hgetall(&meta_key)).await?;
        if fields.is_empty() {
            return Err(BlobError::FileNotFound(*blob_id));
        }
        let metadata = FileMetadata::from_fields(*blob_id, &fields)?;
        let Some(size) = metadata.size_bytes else {
            return Err(BlobError::InvalidMetadata {
                blob_id: *blob_id,
                reason: "size not recorded, write incomplete".to_string(),
            });
        };
        let chunk_size = match metadata.chunk_size {
            Some(recorded) if recorded > MAX_CHUNK_SIZE as u64 => {
                return Err(BlobError::InvalidMetadata {
                    blob_id: *blob_id,
                    reason: format!("chunk size {recorded} exceeds {MAX_CHUNK_SIZE}"),
                });
            }
            Some(recorded) => recorded as usize,
            None => self.ctx.settings.chunk_size,
        };
        if usize::try_from(size).is_err() {
            return Err(BlobError::InvalidMetadata {
                blob_id: *blob_id,
                reason: format!("size {size} does not fit in memory"),
            });
        }
        debug!(%blob_id, size, chunk_size, endpoint = %node.endpoint(), "retrieving file");

        // Grows with the chunks actually read; the recorded size is not trusted.
        let mut data = BytesMut::with_capacity(size.min(chunk_size as u64) as usize);
        for offset in chunk_offsets(size, chunk_size) {
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }
            let key = self.ctx.keys.chunk_key(blob_id, offset);
            let chunk = retry(policy, clock, cancel, "chunk read", || node.get(&key)).await?;

            let corrupt = |reason: String| {
                warn!(%blob_id, offset, %reason, "corrupt file");
                BlobError::CorruptFile {
                    blob_id: *blob_id,
                    offset,
                    reason,
                }
            };
            let chunk = match chunk {
                Some(chunk) if !chunk.is_empty() => chunk,
                Some(_) => return Err(corrupt("empty chunk".to_string())),
                None => return Err(corrupt("missing chunk".to_string())),
            };
            let expected = (size - offset).min(chunk_size as u64) as usize;
            if chunk.len() != expected {
                return Err(corrupt(format!(
                    "chunk holds {} bytes, expected {expected}",
                    chunk.len()
                )));
            }

            self.ctx.metrics.bytes_sent(chunk.len());
            data.extend_from_slice(&chunk);
        }

        Ok(RetrievedBlob {
            data: data.freeze(),
            extension: metadata.extension,
        })
    }
}
