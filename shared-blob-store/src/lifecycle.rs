//! Existence checks, deletion and listing of cluster-stored blobs.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::KvNode;
use crate::error::{BackendError, BlobError};
use crate::keys::{KeyKind, CHUNK_SUFFIX};
use crate::retry::{retry, RetryError};
use crate::store::Context;
use crate::types::{chunk_offsets, BlobId, FileMetadata, MAX_CHUNK_SIZE};

/// Upper bound on scan round-trips, on top of the scan timeout.
const MAX_SCAN_PAGES: usize = 10_000;
/// Recorded layouts implying more chunks than this are deleted by scan.
const MAX_OFFSET_DELETES: u64 = 1 << 20;

/// What happened to one key during a cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    NotFound,
    Failed(BackendError),
}

/// Per-key results of a delete or a rollback.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    entries: Vec<(String, CleanupOutcome)>,
    /// Set when a pattern scan hit its time box before finishing.
    pub scan_truncated: bool,
}

impl CleanupReport {
    pub fn record(&mut self, key: String, outcome: CleanupOutcome) {
        self.entries.push((key, outcome));
    }

    pub fn entries(&self) -> &[(String, CleanupOutcome)] {
        &self.entries
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| matches!(o, CleanupOutcome::Deleted))
    }

    pub fn not_found(&self) -> usize {
        self.count(|o| matches!(o, CleanupOutcome::NotFound))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CleanupOutcome::Failed(_)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Keys whose deletion failed, with the error.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &BackendError)> {
        self.entries.iter().filter_map(|(key, outcome)| match outcome {
            CleanupOutcome::Failed(e) => Some((key.as_str(), e)),
            _ => None,
        })
    }

    fn chunks_deleted(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(key, outcome)| {
                *outcome == CleanupOutcome::Deleted && key.contains(&format!(":{CHUNK_SUFFIX}:"))
            })
            .count() as u64
    }

    fn count(&self, pred: impl Fn(&CleanupOutcome) -> bool) -> usize {
        self.entries.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn log(&self, blob_id: &BlobId, what: &str) {
        for (key, err) in self.failures() {
            warn!(%blob_id, key, error = %err, "{what}: failed to delete key");
        }
        if self.failed() > 0 || self.scan_truncated {
            warn!(
                %blob_id,
                deleted = self.deleted(),
                not_found = self.not_found(),
                failed = self.failed(),
                scan_truncated = self.scan_truncated,
                "{what} incomplete"
            );
        } else {
            debug!(
                %blob_id,
                deleted = self.deleted(),
                not_found = self.not_found(),
                "{what} complete"
            );
        }
    }
}

pub struct LifecycleManager {
    ctx: Context,
}

impl LifecycleManager {
    pub(crate) fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Metadata presence only. Backend trouble reads as "absent".
    pub async fn file_exists(&self, blob_id: &BlobId) -> bool {
        let cancel = CancellationToken::new();
        let node = match self.ctx.supervisor.acquire_readable_node(&cancel).await {
            Ok(Some(node)) => node,
            Ok(None) => return false,
            Err(e) => {
                debug!(%blob_id, error = %e, "existence check could not reach the cluster");
                return false;
            }
        };

        let key = self.ctx.keys.metadata_key(blob_id);
        match node.exists(&key).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(%blob_id, error = %e, "existence check failed");
                false
            }
        }
    }

    /// Deletes every key of the blob.
    ///
    /// Uses the recorded size to address chunks directly, and a time-boxed
    /// pattern scan when the size is unknown. Individual failures end up in
    /// the report, except a read-only replica error which aborts the delete.
    pub async fn delete_file(
        &self,
        blob_id: &BlobId,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, BlobError> {
        let handle = self.ctx.supervisor.reacquire(cancel).await?;
        let node = Arc::clone(handle.node());
        let meta_key = self.ctx.keys.metadata_key(blob_id);

        let metadata = match node.hgetall(&meta_key).await {
            Ok(fields) if fields.is_empty() => None,
            Ok(fields) => match FileMetadata::from_fields(*blob_id, &fields) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    debug!(%blob_id, error = %e, "unreadable metadata, falling back to scan");
                    None
                }
            },
            Err(e) if e.is_read_only() => return Err(BlobError::from_write(e)),
            Err(e) => {
                debug!(%blob_id, error = %e, "metadata lookup failed, falling back to scan");
                None
            }
        };

        let mut report = CleanupReport::default();
        let layout = metadata.as_ref().and_then(|m| {
            let size = m.size_bytes?;
            let chunk_size = match m.chunk_size {
                Some(recorded) if recorded > MAX_CHUNK_SIZE as u64 => return None,
                Some(recorded) => recorded as usize,
                None => self.ctx.settings.chunk_size,
            };
            (size.div_ceil(chunk_size as u64) <= MAX_OFFSET_DELETES).then_some((size, chunk_size))
        });
        match layout {
            Some((size, chunk_size)) => {
                debug!(%blob_id, size, chunk_size, "deleting chunks by offset");
                for offset in chunk_offsets(size, chunk_size) {
                    let key = self.ctx.keys.chunk_key(blob_id, offset);
                    let outcome = self.delete_key(node.as_ref(), &key, cancel).await?;
                    report.record(key, outcome);
                }
            }
            None => {
                debug!(%blob_id, "no usable recorded layout, deleting by pattern scan");
                self.scan_delete(node.as_ref(), blob_id, &mut report, cancel)
                    .await?;
            }
        }

        if !report.contains(&meta_key) {
            let outcome = self.delete_key(node.as_ref(), &meta_key, cancel).await?;
            report.record(meta_key, outcome);
        }

        self.ctx.metrics.chunks_deleted(report.chunks_deleted());
        report.log(blob_id, "delete");
        info!(%blob_id, deleted = report.deleted(), "file deleted");
        Ok(report)
    }

    /// Best-effort removal of `keys`; nothing is propagated.
    pub(crate) async fn remove_keys(&self, node: &dyn KvNode, keys: &[String]) -> CleanupReport {
        let cancel = CancellationToken::new();
        let mut report = CleanupReport::default();
        for key in keys.iter().rev() {
            let outcome = match self.delete_key(node, key, &cancel).await {
                Ok(outcome) => outcome,
                Err(BlobError::ReadOnlyReplica(msg)) => {
                    CleanupOutcome::Failed(BackendError::ReadOnly(msg))
                }
                Err(e) => CleanupOutcome::Failed(BackendError::Protocol(e.to_string())),
            };
            report.record(key.clone(), outcome);
        }
        report
    }

    /// Ids of every blob with a metadata record, sorted.
    pub async fn list_files(&self, cancel: &CancellationToken) -> Result<Vec<BlobId>, BlobError> {
        let Some(node) = self.ctx.supervisor.acquire_readable_node(cancel).await? else {
            return Ok(Vec::new());
        };
        let pattern = self.ctx.keys.key_pattern_for_entity_type(KeyKind::File);

        let mut ids = BTreeSet::new();
        let scan = async {
            let mut cursor = 0;
            for _ in 0..MAX_SCAN_PAGES {
                let page = self.scan_page(node.as_ref(), &pattern, cursor, cancel).await?;
                ids.extend(
                    page.keys
                        .iter()
                        .filter_map(|key| self.ctx.keys.blob_id_from_metadata_key(key)),
                );
                cursor = page.cursor;
                if cursor == 0 {
                    break;
                }
            }
            Ok::<_, BlobError>(())
        };
        let outcome = tokio::time::timeout(self.ctx.settings.scan_timeout, scan).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => warn!(found = ids.len(), "listing hit the scan time box, result is partial"),
        }
        Ok(ids.into_iter().collect())
    }

    async fn scan_delete(
        &self,
        node: &dyn KvNode,
        blob_id: &BlobId,
        report: &mut CleanupReport,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError> {
        let pattern = self.ctx.keys.blob_key_pattern(blob_id);
        let scan = async {
            let mut cursor = 0;
            for _ in 0..MAX_SCAN_PAGES {
                let page = match self.scan_page(node, &pattern, cursor, cancel).await {
                    Ok(page) => page,
                    Err(BlobError::Cancelled) => return Err(BlobError::Cancelled),
                    Err(e) => {
                        warn!(%blob_id, error = %e, "pattern scan failed, stopping early");
                        report.scan_truncated = true;
                        return Ok(());
                    }
                };
                for key in page.keys {
                    if report.contains(&key) {
                        continue;
                    }
                    let outcome = self.delete_key(node, &key, cancel).await?;
                    report.record(key, outcome);
                }
                cursor = page.cursor;
                if cursor == 0 {
                    return Ok(());
                }
            }
            report.scan_truncated = true;
            Ok::<(), BlobError>(())
        };

        let outcome = tokio::time::timeout(self.ctx.settings.scan_timeout, scan).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(%blob_id, timeout = ?self.ctx.settings.scan_timeout, "pattern scan timed out");
                report.scan_truncated = true;
                Ok(())
            }
        }
    }

    async fn scan_page(
        &self,
        node: &dyn KvNode,
        pattern: &str,
        cursor: u64,
        cancel: &CancellationToken,
    ) -> Result<crate::backend::ScanPage, BlobError> {
        let batch = self.ctx.settings.scan_batch;
        Ok(retry(
            &self.ctx.settings.read_retry,
            self.ctx.clock.as_ref(),
            cancel,
            "scan",
            || node.scan(pattern, cursor, batch),
        )
        .await?)
    }

    /// Deletes one key. Only a read-only replica error or cancellation is
    /// returned as `Err`; every other failure becomes `Failed`.
    async fn delete_key(
        &self,
        node: &dyn KvNode,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<CleanupOutcome, BlobError> {
        let result = retry(
            &self.ctx.settings.chunk_retry,
            self.ctx.clock.as_ref(),
            cancel,
            "delete",
            || node.del(key),
        )
        .await;
        match result {
            Ok(true) => Ok(CleanupOutcome::Deleted),
            Ok(false) => Ok(CleanupOutcome::NotFound),
            Err(RetryError::Fatal(e)) if e.is_read_only() => Err(BlobError::from_write(e)),
            Err(RetryError::Cancelled) => Err(BlobError::Cancelled),
            Err(RetryError::Fatal(e)) | Err(RetryError::Exhausted { last: e, .. }) => {
                Ok(CleanupOutcome::Failed(e))
            }
        }
    }
}
