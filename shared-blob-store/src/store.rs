//! Public surface of the blob store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ClusterBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreSettings;
use crate::error::BlobError;
use crate::fallback::LocalFallback;
use crate::keys::{KeyPolicy, PrefixedKeyPolicy};
use crate::lifecycle::LifecycleManager;
use crate::metrics::{MetricsCollector, SharedMetrics};
use crate::reader::ChunkedReader;
use crate::supervisor::{Acquisition, ConnectionSupervisor, SupervisorConfig};
use crate::types::{BlobId, RetrievedBlob, MAX_CHUNK_SIZE};
use crate::writer::ChunkedWriter;

/// Collaborators shared by the writer, reader and lifecycle manager.
#[derive(Clone)]
pub(crate) struct Context {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub keys: Arc<dyn KeyPolicy>,
    pub clock: Arc<dyn Clock>,
    pub metrics: SharedMetrics,
    pub settings: StoreSettings,
}

/// Chunked blob store over a clustered key-value cache.
///
/// Every call first asks the [`ConnectionSupervisor`] whether a cluster is
/// configured. Without one, blobs are kept as whole files in the local
/// fallback directory, with the same contracts minus expiry.
pub struct BlobStore {
    ctx: Context,
    writer: ChunkedWriter,
    reader: ChunkedReader,
    lifecycle: Arc<LifecycleManager>,
    fallback: LocalFallback,
}

impl BlobStore {
    pub fn builder() -> BlobStoreBuilder {
        BlobStoreBuilder::default()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.ctx.supervisor
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.ctx.settings
    }

    /// True when no cluster backend is configured.
    pub fn is_fallback(&self) -> bool {
        !self.ctx.supervisor.backend_configured()
    }

    /// Stores `source` and returns the new blob's id.
    ///
    /// `extension` is kept verbatim (e.g. `".pdf"`) and handed back on
    /// retrieve. `ttl` overrides the key policy's default expiration.
    pub async fn store_file<R>(
        &self,
        source: &mut R,
        extension: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<BlobId, BlobError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.store_file_cancellable(source, extension, ttl, &CancellationToken::new())
            .await
    }

    pub async fn store_file_cancellable<R>(
        &self,
        source: &mut R,
        extension: Option<&str>,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<BlobId, BlobError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let extension = validate_extension(extension.unwrap_or_default())?;

        match self.ctx.supervisor.acquire_writable_handle(cancel).await? {
            Acquisition::Handle(handle) => {
                self.writer
                    .store(handle, source, extension, ttl, cancel)
                    .await
            }
            Acquisition::Fallback => {
                self.ctx.metrics.fallback_used();
                let blob_id = BlobId::new();
                debug!(%blob_id, root = %self.fallback.root().display(), "no cluster configured, storing locally");
                let size = self.fallback.store(&blob_id, source, extension, ttl).await?;
                self.ctx.metrics.bytes_received(size as usize);
                info!(%blob_id, size, "file stored");
                Ok(blob_id)
            }
        }
    }

    /// Stores the file at `path`, keeping its extension.
    pub async fn store_file_from_path(
        &self,
        path: impl AsRef<Path>,
        ttl: Option<Duration>,
    ) -> Result<BlobId, BlobError> {
        let path = path.as_ref();
        let extension = match path.extension() {
            Some(ext) => match ext.to_str() {
                Some(ext) => Some(format!(".{ext}")),
                None => {
                    return Err(BlobError::InvalidExtension(
                        ext.to_string_lossy().into_owned(),
                    ))
                }
            },
            None => None,
        };
        let mut file = tokio::fs::File::open(path).await?;
        self.store_file(&mut file, extension.as_deref(), ttl).await
    }

    pub async fn retrieve_file(&self, blob_id: &BlobId) -> Result<RetrievedBlob, BlobError> {
        self.retrieve_file_cancellable(blob_id, &CancellationToken::new())
            .await
    }

    pub async fn retrieve_file_cancellable(
        &self,
        blob_id: &BlobId,
        cancel: &CancellationToken,
    ) -> Result<RetrievedBlob, BlobError> {
        if self.is_fallback() {
            self.ctx.metrics.fallback_used();
            let blob = self.fallback.retrieve(blob_id).await?;
            self.ctx.metrics.bytes_sent(blob.len());
            return Ok(blob);
        }
        self.reader.retrieve(blob_id, cancel).await
    }

    /// Retrieves the blob into a fresh temporary file and returns its path.
    /// The caller owns the file.
    pub async fn retrieve_file_to_path(&self, blob_id: &BlobId) -> Result<PathBuf, BlobError> {
        let blob = self.retrieve_file(blob_id).await?;
        let dir = self.ctx.settings.fallback_dir.join("retrieved");
        let prefix = format!("{blob_id}-");

        let path = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            let mut file = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(&blob.extension)
                .tempfile_in(&dir)?;
            std::io::Write::write_all(&mut file, &blob.data)?;
            let (_, path) = file.keep().map_err(|e| e.error)?;
            Ok(path)
        })
        .await
        .map_err(|e| BlobError::Io(std::io::Error::other(format!("blocking write failed: {e}"))))??;

        debug!(%blob_id, path = %path.display(), "file retrieved to path");
        Ok(path)
    }

    /// Removes the blob. Unknown ids are not an error.
    pub async fn delete_file(&self, blob_id: &BlobId) -> Result<(), BlobError> {
        if self.is_fallback() {
            self.ctx.metrics.fallback_used();
            self.fallback.delete(blob_id).await?;
            return Ok(());
        }
        self.lifecycle
            .delete_file(blob_id, &CancellationToken::new())
            .await?;
        Ok(())
    }

    /// Advisory: any failure reads as `false`.
    pub async fn file_exists(&self, blob_id: &BlobId) -> bool {
        if self.is_fallback() {
            return self.fallback.exists(blob_id).await;
        }
        self.lifecycle.file_exists(blob_id).await
    }

    pub async fn list_files(&self) -> Result<Vec<BlobId>, BlobError> {
        if self.is_fallback() {
            return self.fallback.list().await;
        }
        self.lifecycle.list_files(&CancellationToken::new()).await
    }
}

/// Extensions end up in file names on the fallback path.
fn validate_extension(extension: &str) -> Result<&str, BlobError> {
    if extension.contains(['/', '\\', '\0']) {
        return Err(BlobError::InvalidExtension(extension.to_string()));
    }
    Ok(extension)
}

/// Wires a [`BlobStore`] from its collaborators. Without a backend the
/// store runs on the local fallback.
#[derive(Default)]
pub struct BlobStoreBuilder {
    backend: Option<Arc<dyn ClusterBackend>>,
    keys: Option<Arc<dyn KeyPolicy>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: SharedMetrics,
    settings: StoreSettings,
    supervisor_config: SupervisorConfig,
}

impl BlobStoreBuilder {
    pub fn backend(mut self, backend: Arc<dyn ClusterBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn key_policy(mut self, keys: Arc<dyn KeyPolicy>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = SharedMetrics::new(collector);
        self
    }

    pub fn settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Clamped to `1..=MAX_CHUNK_SIZE` when the store is built.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.settings.chunk_size = chunk_size;
        self
    }

    pub fn fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.settings.fallback_dir = dir.into();
        self
    }

    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    pub fn build(mut self) -> BlobStore {
        let chunk_size = self.settings.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        if chunk_size != self.settings.chunk_size {
            warn!(
                requested = self.settings.chunk_size,
                chunk_size, "chunk size out of range, clamped"
            );
            self.settings.chunk_size = chunk_size;
        }
        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(PrefixedKeyPolicy::default()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            self.backend,
            Arc::clone(&keys),
            Arc::clone(&clock),
            self.supervisor_config,
        ));

        let ctx = Context {
            supervisor,
            keys,
            clock,
            metrics: self.metrics,
            settings: self.settings,
        };
        let lifecycle = Arc::new(LifecycleManager::new(ctx.clone()));
        BlobStore {
            writer: ChunkedWriter::new(ctx.clone(), Arc::clone(&lifecycle)),
            reader: ChunkedReader::new(ctx.clone()),
            fallback: LocalFallback::new(&ctx.settings.fallback_dir),
            lifecycle,
            ctx,
        }
    }
}
