//! Chunked blob writer.
//!
//! Layout of a stored blob:
//! - metadata hash: extension, creation time, chunk size, and (last) the size
//! - one plain key per chunk, named after the chunk's byte offset
//!
//! Chunk keys encode their position, so re-sending a chunk after a transient
//! failure or after switching to another master is always safe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::KvNode;
use crate::error::{BackendError, BlobError};
use crate::keys::KeyKind;
use crate::lifecycle::{CleanupReport, LifecycleManager};
use crate::retry::{retry, RetryError};
use crate::store::Context;
use crate::supervisor::WritableHandle;
use crate::types::{BlobId, FileMetadata};

/// Mutable state of one store call.
struct WriteSession {
    blob_id: BlobId,
    handle: WritableHandle,
    /// Keys a write was attempted for, in order; rollback deletes them.
    attempted: Vec<String>,
    reacquisitions: u32,
}

pub struct ChunkedWriter {
    ctx: Context,
    lifecycle: Arc<LifecycleManager>,
}

impl ChunkedWriter {
    pub(crate) fn new(ctx: Context, lifecycle: Arc<LifecycleManager>) -> Self {
        Self { ctx, lifecycle }
    }

    /// Writes `source` as a new blob and returns its id once the metadata
    /// carries the final size. On failure everything written so far is
    /// removed (best effort) and `StorageWriteFailed` is returned, or
    /// `Cancelled` when `cancel` fired.
    pub async fn store<R>(
        &self,
        handle: WritableHandle,
        source: &mut R,
        extension: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<BlobId, BlobError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let ttl = ttl.unwrap_or_else(|| self.ctx.keys.expiration_for_key_type(KeyKind::File));
        let mut session = WriteSession {
            blob_id: BlobId::new(),
            handle,
            attempted: Vec::new(),
            reacquisitions: 0,
        };
        let blob_id = session.blob_id;
        debug!(%blob_id, endpoint = %session.handle.endpoint(), verified = session.handle.is_verified(), "storing file");

        match self.write_blob(&mut session, source, extension, ttl, cancel).await {
            Ok(size) => {
                info!(%blob_id, size, ?ttl, "file stored");
                Ok(blob_id)
            }
            Err(BlobError::Cancelled) => {
                info!(%blob_id, "store cancelled, rolling back");
                self.rollback(&session).await;
                Err(BlobError::Cancelled)
            }
            Err(e) => {
                error!(%blob_id, error = %e, "store failed, rolling back");
                self.rollback(&session).await;
                Err(BlobError::StorageWriteFailed {
                    blob_id,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn write_blob<R>(
        &self,
        session: &mut WriteSession,
        source: &mut R,
        extension: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, BlobError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let blob_id = session.blob_id;
        let chunk_size = self.ctx.settings.chunk_size;
        let meta_key = self.ctx.keys.metadata_key(&blob_id);

        let metadata = FileMetadata::new(blob_id, extension, self.ctx.clock.now(), chunk_size);
        let fields = metadata.initial_fields();
        session.attempted.push(meta_key.clone());
        self.write_with_failover(session, cancel, "metadata write", |node| {
            let key = meta_key.clone();
            let fields = fields.clone();
            async move {
                node.hset(&key, &fields).await?;
                node.expire(&key, ttl).await
            }
        })
        .await?;

        let mut buf = vec![0u8; chunk_size];
        let mut offset: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }
            let filled = read_chunk(source, &mut buf).await?;
            if filled == 0 {
                break;
            }

            let key = self.ctx.keys.chunk_key(&blob_id, offset);
            let data = Bytes::copy_from_slice(&buf[..filled]);
            session.attempted.push(key.clone());
            self.write_with_failover(session, cancel, "chunk write", |node| {
                let key = key.clone();
                let data = data.clone();
                async move { node.set(&key, data, Some(ttl)).await }
            })
            .await?;

            self.ctx.metrics.chunk_written();
            self.ctx.metrics.bytes_received(filled);
            debug!(%blob_id, offset, len = filled, "chunk written");

            offset += filled as u64;
            if filled < chunk_size {
                break;
            }
        }

        // The size is the completion marker: readers ignore the blob until it lands.
        let completion = vec![FileMetadata::completion_field(offset)];
        self.write_with_failover(session, cancel, "metadata completion", |node| {
            let key = meta_key.clone();
            let fields = completion.clone();
            async move { node.hset(&key, &fields).await }
        })
        .await?;

        Ok(offset)
    }

    /// Runs `op` against the session's node with the chunk retry policy.
    /// A read-only replica error swaps the handle for a freshly acquired one
    /// and resumes the same operation.
    async fn write_with_failover<F, Fut>(
        &self,
        session: &mut WriteSession,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<(), BlobError>
    where
        F: FnMut(Arc<dyn KvNode>) -> Fut,
        Fut: Future<Output = Result<(), BackendError>>,
    {
        loop {
            let node = Arc::clone(session.handle.node());
            let mut attempts = 0u32;
            let result = retry(
                &self.ctx.settings.chunk_retry,
                self.ctx.clock.as_ref(),
                cancel,
                what,
                || {
                    attempts += 1;
                    op(Arc::clone(&node))
                },
            )
            .await;
            for _ in 1..attempts {
                self.ctx.metrics.chunk_write_retried();
            }

            match result {
                Ok(()) => return Ok(()),
                Err(RetryError::Fatal(BackendError::ReadOnly(msg))) => {
                    if session.reacquisitions >= self.ctx.settings.max_reacquisitions {
                        self.ctx.metrics.chunk_write_error();
                        return Err(BlobError::ReadOnlyReplica(msg));
                    }
                    session.reacquisitions += 1;
                    self.ctx.metrics.handle_reacquired();
                    warn!(
                        blob_id = %session.blob_id,
                        endpoint = %node.endpoint(),
                        reacquisitions = session.reacquisitions,
                        "{what} reached a read-only replica, re-acquiring a writable handle"
                    );
                    session.handle = self.ctx.supervisor.reacquire(cancel).await?;
                }
                Err(e) => {
                    self.ctx.metrics.chunk_write_error();
                    return Err(e.into());
                }
            }
        }
    }

    async fn rollback(&self, session: &WriteSession) {
        if session.attempted.is_empty() {
            return;
        }
        let blob_id = session.blob_id;
        let mut report = self
            .lifecycle
            .remove_keys(session.handle.node().as_ref(), &session.attempted)
            .await;

        // The handle may have gone stale with the failure; one fresh try for
        // the keys a replica refused.
        let refused: Vec<String> = report
            .failures()
            .filter(|(_, e)| e.is_read_only())
            .map(|(key, _)| key.to_string())
            .collect();
        if !refused.is_empty() {
            match self.ctx.supervisor.reacquire(&CancellationToken::new()).await {
                Ok(handle) => {
                    let retried = self.lifecycle.remove_keys(handle.node().as_ref(), &refused).await;
                    let mut merged = CleanupReport::default();
                    for (key, outcome) in report.entries() {
                        if !refused.contains(key) {
                            merged.record(key.clone(), outcome.clone());
                        }
                    }
                    for (key, outcome) in retried.entries() {
                        merged.record(key.clone(), outcome.clone());
                    }
                    report = merged;
                }
                Err(e) => warn!(%blob_id, error = %e, "rollback could not re-acquire a writable handle"),
            }
        }

        report.log(&blob_id, "rollback");
    }
}

/// Fills `buf` from `source`; returns fewer bytes only at end of stream.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> Result<usize, BlobError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_chunk_fills_buffer_across_short_reads() {
        let data: Vec<u8> = (0..10u8).collect();
        let mut source = tokio::io::BufReader::with_capacity(3, &data[..]);
        let mut buf = [0u8; 4];

        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 4);
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[8, 9]);
        assert_eq!(read_chunk(&mut source, &mut buf).await.unwrap(), 0);
    }
}
