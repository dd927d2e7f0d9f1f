use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use shared_blob_store::backend::{FaultKind, FaultOp};
use shared_blob_store::{
    BlobError, BlobId, BlobStore, ClusterBackend, Endpoint, KvNode, ManualClock, MemoryCluster,
    MetricsCollector, NodeRole, StoreSettings,
};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

const SMALL_CHUNK: usize = 4;

struct Harness {
    store: BlobStore,
    cluster: MemoryCluster,
    clock: ManualClock,
    metrics: Arc<CountingMetrics>,
}

fn harness(roles: &[NodeRole], chunk_size: usize) -> Harness {
    harness_with(
        roles,
        StoreSettings {
            chunk_size,
            ..Default::default()
        },
    )
}

fn harness_with(roles: &[NodeRole], settings: StoreSettings) -> Harness {
    let clock = ManualClock::new();
    let cluster = MemoryCluster::with_roles(Arc::new(clock.clone()), roles);
    let metrics = Arc::new(CountingMetrics::default());
    let store = BlobStore::builder()
        .backend(Arc::new(cluster.clone()))
        .clock(Arc::new(clock.clone()))
        .metrics(metrics.clone())
        .settings(settings)
        .build();
    Harness {
        store,
        cluster,
        clock,
        metrics,
    }
}

fn meta_key(id: &BlobId) -> String {
    format!("blobs:file:{id}:meta")
}

fn chunk_key(id: &BlobId, offset: u64) -> String {
    format!("blobs:file:{id}:chunk:{offset}")
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Default)]
struct CountingMetrics {
    chunks_written: AtomicU64,
    write_errors: AtomicU64,
    retries: AtomicU64,
    reacquisitions: AtomicU64,
    chunks_deleted: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    fallback: AtomicU64,
}

impl MetricsCollector for CountingMetrics {
    fn chunk_written(&self) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
    }
    fn chunk_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }
    fn chunk_write_retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    fn handle_reacquired(&self) {
        self.reacquisitions.fetch_add(1, Ordering::Relaxed);
    }
    fn chunks_deleted(&self, amount: u64) {
        self.chunks_deleted.fetch_add(amount, Ordering::Relaxed);
    }
    fn bytes_sent(&self, amount: usize) {
        self.bytes_sent.fetch_add(amount as u64, Ordering::Relaxed);
    }
    fn bytes_received(&self, amount: usize) {
        self.bytes_received.fetch_add(amount as u64, Ordering::Relaxed);
    }
    fn fallback_used(&self) {
        self.fallback.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serves `data` and cancels `token` once `cancel_at` bytes have been read.
struct CancellingReader {
    data: Vec<u8>,
    pos: usize,
    cancel_at: usize,
    token: CancellationToken,
}

impl AsyncRead for CancellingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.cancel_at {
            self.token.cancel();
        }
        let pos = self.pos;
        let end = (pos + buf.remaining()).min(self.data.len());
        buf.put_slice(&self.data[pos..end]);
        self.pos = end;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_round_trip_across_chunk_boundaries() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);

    for len in [0usize, SMALL_CHUNK, 3 * SMALL_CHUNK, 3 * SMALL_CHUNK + 2] {
        let data = payload(len);
        let id = h
            .store
            .store_file(&mut &data[..], Some(".bin"), None)
            .await
            .unwrap();

        let chunks = h.cluster.keys(&format!("blobs:file:{id}:chunk:*"));
        assert_eq!(chunks.len(), len.div_ceil(SMALL_CHUNK), "chunks for {len} bytes");

        let blob = h.store.retrieve_file(&id).await.unwrap();
        assert_eq!(blob.data, Bytes::from(data));
        assert_eq!(blob.extension, ".bin");
        assert!(h.store.file_exists(&id).await);
    }
}

#[tokio::test]
async fn test_zero_chunk_size_setting_still_stores_everything() {
    let h = harness_with(
        &[NodeRole::Master],
        StoreSettings {
            chunk_size: 0,
            ..Default::default()
        },
    );
    let data = b"hello world".to_vec();

    let id = h
        .store
        .store_file(&mut &data[..], Some(".txt"), None)
        .await
        .unwrap();

    let meta = h.cluster.hash(&meta_key(&id)).unwrap();
    assert_eq!(meta.get("size_bytes").map(String::as_str), Some("11"));
    assert_eq!(h.store.retrieve_file(&id).await.unwrap().data, Bytes::from(data));
}

#[tokio::test]
async fn test_scenario_a_three_and_a_half_mib() {
    let h = harness(&[NodeRole::Master, NodeRole::Replica], shared_blob_store::DEFAULT_CHUNK_SIZE);
    let data = payload(3_670_016);

    let id = h
        .store
        .store_file(&mut &data[..], Some(".pdf"), None)
        .await
        .unwrap();

    for offset in [0u64, 1_048_576, 2_097_152, 3_145_728] {
        assert!(h.cluster.value(&chunk_key(&id, offset)).is_some(), "chunk {offset}");
    }
    assert_eq!(h.cluster.keys(&format!("blobs:file:{id}:chunk:*")).len(), 4);
    assert_eq!(
        h.cluster.value(&chunk_key(&id, 3_145_728)).unwrap().len(),
        524_288
    );

    let meta = h.cluster.hash(&meta_key(&id)).unwrap();
    assert_eq!(meta.get("size_bytes").map(String::as_str), Some("3670016"));
    assert_eq!(meta.get("extension").map(String::as_str), Some(".pdf"));
    assert_eq!(h.metrics.chunks_written.load(Ordering::Relaxed), 4);
    assert_eq!(h.metrics.bytes_received.load(Ordering::Relaxed), 3_670_016);

    let blob = h.store.retrieve_file(&id).await.unwrap();
    assert_eq!(blob.len(), 3_670_016);
    assert_eq!(blob.data, Bytes::from(data));
}

#[tokio::test]
async fn test_ttl_applied_to_every_key() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &b"abcdefgh"[..], None, Some(Duration::from_secs(90)))
        .await
        .unwrap();

    assert_eq!(h.cluster.ttl(&meta_key(&id)), Some(Duration::from_secs(90)));
    assert_eq!(h.cluster.ttl(&chunk_key(&id, 4)), Some(Duration::from_secs(90)));

    let id = h
        .store
        .store_file(&mut &b"abcd"[..], None, None)
        .await
        .unwrap();
    let day = Duration::from_secs(24 * 60 * 60);
    assert_eq!(h.cluster.ttl(&meta_key(&id)), Some(day));
    assert_eq!(h.cluster.ttl(&chunk_key(&id, 0)), Some(day));
}

#[tokio::test]
async fn test_scenario_b_all_replicas() {
    let h = harness(&[NodeRole::Replica, NodeRole::Replica, NodeRole::Replica], SMALL_CHUNK);

    let err = h
        .store
        .store_file(&mut &b"payload"[..], Some(".txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::NoWritableNode), "{err:?}");
    assert!(h.cluster.keys("*").is_empty());

    // Reads still go through a replica.
    let missing = BlobId::new();
    assert!(matches!(
        h.store.retrieve_file(&missing).await,
        Err(BlobError::FileNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn test_retrieve_unknown_id() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = BlobId::new();

    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::FileNotFound(_))
    ));
    assert!(!h.store.file_exists(&id).await);
}

#[tokio::test]
async fn test_transient_chunk_failure_is_retried() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    h.cluster
        .inject(FaultOp::Set, "blobs:file:*:chunk:4", 2, FaultKind::Transient);
    let data = payload(10);

    let id = h
        .store
        .store_file(&mut &data[..], None, None)
        .await
        .unwrap();

    assert_eq!(h.cluster.command_count(FaultOp::Set, "blobs:file:*:chunk:4"), 3);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(250); 2]);
    assert_eq!(h.metrics.retries.load(Ordering::Relaxed), 2);
    assert_eq!(h.store.retrieve_file(&id).await.unwrap().data, Bytes::from(data));
}

#[tokio::test]
async fn test_chunk_rewritten_after_lost_reply() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    h.cluster.inject(
        FaultOp::Set,
        "blobs:file:*:chunk:4",
        1,
        FaultKind::AppliedThenTimeout,
    );
    let data = payload(10);

    let id = h
        .store
        .store_file(&mut &data[..], None, None)
        .await
        .unwrap();

    // The first attempt landed; the retry overwrote the same key.
    assert_eq!(h.cluster.command_count(FaultOp::Set, "blobs:file:*:chunk:4"), 2);
    assert_eq!(h.metrics.retries.load(Ordering::Relaxed), 1);
    assert_eq!(h.cluster.keys(&format!("blobs:file:{id}:chunk:*")).len(), 3);
    assert_eq!(
        h.cluster.value(&chunk_key(&id, 4)),
        Some(Bytes::copy_from_slice(&data[4..8]))
    );
    assert_eq!(h.store.retrieve_file(&id).await.unwrap().data, Bytes::from(data));
}

#[tokio::test]
async fn test_partial_write_is_rolled_back() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    h.cluster
        .inject(FaultOp::Set, "blobs:file:*:chunk:8", 10, FaultKind::Transient);

    let err = h
        .store
        .store_file(&mut &payload(20)[..], None, None)
        .await
        .unwrap_err();

    let BlobError::StorageWriteFailed { blob_id, source } = err else {
        panic!("unexpected error: {err:?}");
    };
    assert!(matches!(*source, BlobError::TransientExhausted { attempts: 3, .. }));
    assert!(h.cluster.keys("blobs:file:*").is_empty());
    assert!(!h.store.file_exists(&blob_id).await);
    assert_eq!(h.metrics.write_errors.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failover_mid_write_resumes_on_new_master() {
    let h = harness(&[NodeRole::Master, NodeRole::Replica], SMALL_CHUNK);
    h.cluster
        .inject(FaultOp::Set, "blobs:file:*:chunk:8", 1, FaultKind::Failover);
    let data = payload(14);

    let id = h
        .store
        .store_file(&mut &data[..], Some(".bin"), None)
        .await
        .unwrap();

    assert_eq!(h.metrics.reacquisitions.load(Ordering::Relaxed), 1);
    assert_eq!(h.cluster.keys(&format!("blobs:file:{id}:chunk:*")).len(), 4);
    let meta = h.cluster.hash(&meta_key(&id)).unwrap();
    assert_eq!(meta.get("size_bytes").map(String::as_str), Some("14"));
    assert_eq!(h.store.retrieve_file(&id).await.unwrap().data, Bytes::from(data));
}

#[tokio::test]
async fn test_replica_writes_give_up_after_bounded_reacquisitions() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    h.cluster
        .inject(FaultOp::Set, "blobs:file:*:chunk:*", 100, FaultKind::ReadOnly);

    let err = h
        .store
        .store_file(&mut &payload(8)[..], None, None)
        .await
        .unwrap_err();

    let BlobError::StorageWriteFailed { source, .. } = err else {
        panic!("unexpected error: {err:?}");
    };
    assert!(matches!(*source, BlobError::ReadOnlyReplica(_)));
    assert_eq!(h.metrics.reacquisitions.load(Ordering::Relaxed), 3);
    assert!(h.cluster.keys("blobs:file:*").is_empty());
}

#[tokio::test]
async fn test_blob_expires_with_ttl() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &b"short lived"[..], None, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(h.store.file_exists(&id).await);

    h.clock.advance(Duration::from_secs(61));

    assert!(!h.store.file_exists(&id).await);
    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::FileNotFound(_))
    ));
}

#[tokio::test]
async fn test_incomplete_blob_is_not_served() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = BlobId::new();
    let node = seed_node(&h.cluster).await;
    node.hset(
        &meta_key(&id),
        &[("created_at".to_string(), chrono::Utc::now().to_rfc3339())],
    )
    .await
    .unwrap();
    node.set(&chunk_key(&id, 0), Bytes::from_static(b"abcd"), None)
        .await
        .unwrap();

    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::InvalidMetadata { .. })
    ));
}

#[tokio::test]
async fn test_missing_chunk_is_corrupt() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &payload(12)[..], None, None)
        .await
        .unwrap();
    let node = seed_node(&h.cluster).await;
    node.del(&chunk_key(&id, 4)).await.unwrap();

    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::CorruptFile { offset: 4, .. })
    ));
}

#[tokio::test]
async fn test_huge_recorded_size_is_corrupt_not_fatal() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = BlobId::new();
    let node = seed_node(&h.cluster).await;
    node.hset(
        &meta_key(&id),
        &[
            ("extension".to_string(), ".bin".to_string()),
            ("created_at".to_string(), chrono::Utc::now().to_rfc3339()),
            ("size_bytes".to_string(), "1125899906842624".to_string()),
        ],
    )
    .await
    .unwrap();

    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::CorruptFile { offset: 0, .. })
    ));

    node.hset(
        &meta_key(&id),
        &[("chunk_size".to_string(), "1099511627776".to_string())],
    )
    .await
    .unwrap();
    assert!(matches!(
        h.store.retrieve_file(&id).await,
        Err(BlobError::InvalidMetadata { .. })
    ));

    h.store.delete_file(&id).await.unwrap();
    assert!(h.cluster.command_count(FaultOp::Scan, "*") > 0);
    assert!(h.cluster.hash(&meta_key(&id)).is_none());
}

#[tokio::test]
async fn test_delete_by_recorded_size() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &payload(10)[..], None, None)
        .await
        .unwrap();

    h.store.delete_file(&id).await.unwrap();

    assert!(h.cluster.keys(&format!("blobs:file:{id}:*")).is_empty());
    assert_eq!(h.cluster.command_count(FaultOp::Scan, "*"), 0);
    assert_eq!(h.metrics.chunks_deleted.load(Ordering::Relaxed), 3);
    assert!(!h.store.file_exists(&id).await);

    // Deleting again is harmless.
    h.store.delete_file(&id).await.unwrap();
}

#[tokio::test]
async fn test_scenario_c_delete_without_size_scans() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = BlobId::new();
    let node = seed_node(&h.cluster).await;
    node.hset(
        &meta_key(&id),
        &[
            ("extension".to_string(), ".txt".to_string()),
            ("created_at".to_string(), chrono::Utc::now().to_rfc3339()),
        ],
    )
    .await
    .unwrap();
    for offset in [0u64, 4, 8] {
        node.set(&chunk_key(&id, offset), Bytes::from_static(b"data"), None)
            .await
            .unwrap();
    }
    let other = h
        .store
        .store_file(&mut &b"keep me"[..], None, None)
        .await
        .unwrap();

    h.store.delete_file(&id).await.unwrap();

    assert!(h.cluster.command_count(FaultOp::Scan, "*") > 0);
    assert!(h.cluster.keys(&format!("blobs:file:{id}:*")).is_empty());
    assert!(h.cluster.hash(&meta_key(&id)).is_none());
    assert!(h.store.file_exists(&other).await);
}

#[tokio::test]
async fn test_scan_delete_across_many_pages() {
    let h = harness_with(
        &[NodeRole::Master],
        StoreSettings {
            chunk_size: SMALL_CHUNK,
            scan_batch: 2,
            ..Default::default()
        },
    );
    let id = BlobId::new();
    let node = seed_node(&h.cluster).await;
    node.hset(
        &meta_key(&id),
        &[
            ("extension".to_string(), ".txt".to_string()),
            ("created_at".to_string(), chrono::Utc::now().to_rfc3339()),
        ],
    )
    .await
    .unwrap();
    for offset in [0u64, 4, 8, 12, 16, 20] {
        node.set(&chunk_key(&id, offset), Bytes::from_static(b"data"), None)
            .await
            .unwrap();
    }

    h.store.delete_file(&id).await.unwrap();

    assert!(h.cluster.command_count(FaultOp::Scan, "*") > 3);
    assert!(h.cluster.keys(&format!("blobs:file:{id}:*")).is_empty());
}

#[tokio::test]
async fn test_delete_swallows_chunk_failures() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &payload(8)[..], None, None)
        .await
        .unwrap();
    h.cluster
        .inject(FaultOp::Delete, "blobs:file:*:chunk:0", 10, FaultKind::Transient);

    h.store.delete_file(&id).await.unwrap();

    assert!(!h.store.file_exists(&id).await);
    assert!(h.cluster.value(&chunk_key(&id, 0)).is_some());
    assert!(h.cluster.value(&chunk_key(&id, 4)).is_none());
}

#[tokio::test]
async fn test_delete_propagates_read_only_replica() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let id = h
        .store
        .store_file(&mut &payload(8)[..], None, None)
        .await
        .unwrap();
    h.cluster
        .inject(FaultOp::Delete, "blobs:file:*:chunk:*", 1, FaultKind::ReadOnly);

    assert!(matches!(
        h.store.delete_file(&id).await,
        Err(BlobError::ReadOnlyReplica(_))
    ));
}

#[tokio::test]
async fn test_cancelled_store_rolls_back() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let token = CancellationToken::new();
    let mut source = CancellingReader {
        data: payload(16),
        pos: 0,
        cancel_at: 8,
        token: token.clone(),
    };

    let err = h
        .store
        .store_file_cancellable(&mut source, None, None, &token)
        .await
        .unwrap_err();

    assert!(matches!(err, BlobError::Cancelled), "{err:?}");
    assert!(h.cluster.keys("blobs:file:*").is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        h.store
            .store_file_cancellable(&mut &b"x"[..], None, None, &token)
            .await,
        Err(BlobError::Cancelled)
    ));
    assert!(h.cluster.keys("*").is_empty());
}

#[tokio::test]
async fn test_list_files_skips_chunks_and_canaries() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            h.store
                .store_file(&mut &payload(9)[..], None, None)
                .await
                .unwrap(),
        );
    }
    ids.sort();

    assert_eq!(h.store.list_files().await.unwrap(), ids);
}

#[tokio::test]
async fn test_fallback_parity() {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(CountingMetrics::default());
    let store = BlobStore::builder()
        .fallback_dir(dir.path())
        .metrics(metrics.clone())
        .chunk_size(SMALL_CHUNK)
        .build();
    assert!(store.is_fallback());
    let data = payload(3_000);

    let id = store
        .store_file(&mut &data[..], Some(".csv"), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(store.file_exists(&id).await);
    assert!(dir.path().join(format!("{id}.csv")).is_file());

    let blob = store.retrieve_file(&id).await.unwrap();
    assert_eq!(blob.data, Bytes::from(data.clone()));
    assert_eq!(blob.extension, ".csv");
    assert_eq!(store.list_files().await.unwrap(), vec![id]);

    let path = store.retrieve_file_to_path(&id).await.unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("csv"));
    assert_eq!(std::fs::read(&path).unwrap(), data);

    store.delete_file(&id).await.unwrap();
    assert!(!store.file_exists(&id).await);
    assert!(matches!(
        store.retrieve_file(&id).await,
        Err(BlobError::FileNotFound(_))
    ));
    assert!(metrics.fallback.load(Ordering::Relaxed) >= 3);
}

#[tokio::test]
async fn test_store_from_path_keeps_extension() {
    let h = harness(&[NodeRole::Master], SMALL_CHUNK);
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("report.pdf");
    std::fs::write(&source, b"%PDF-1.7").unwrap();

    let id = h.store.store_file_from_path(&source, None).await.unwrap();
    let blob = h.store.retrieve_file(&id).await.unwrap();

    assert_eq!(blob.extension, ".pdf");
    assert_eq!(blob.data, Bytes::from_static(b"%PDF-1.7"));
}

/// Direct access to the first node, for seeding states the store never
/// produces on its own.
async fn seed_node(cluster: &MemoryCluster) -> Arc<dyn KvNode> {
    cluster.connect().await.unwrap();
    cluster
        .node(&Endpoint::new("memory-0", NodeRole::Master))
        .await
        .unwrap()
}
