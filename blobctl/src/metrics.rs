//! Prometheus counters behind the store's metrics hook.

use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{register_int_counter, Encoder, IntCounter, TextEncoder};

use shared_blob_store::MetricsCollector;

lazy_static! {
    static ref CHUNKS_WRITTEN: IntCounter = register_int_counter!(
        "blob_store_chunks_written_total",
        "Chunks written to the cluster"
    )
    .expect("failed to register blob_store_chunks_written_total");
    static ref CHUNK_WRITE_ERRORS: IntCounter = register_int_counter!(
        "blob_store_chunk_write_errors_total",
        "Chunk or metadata writes that failed for good"
    )
    .expect("failed to register blob_store_chunk_write_errors_total");
    static ref CHUNK_WRITE_RETRIES: IntCounter = register_int_counter!(
        "blob_store_chunk_write_retries_total",
        "Chunk or metadata writes retried after a transient error"
    )
    .expect("failed to register blob_store_chunk_write_retries_total");
    static ref HANDLES_REACQUIRED: IntCounter = register_int_counter!(
        "blob_store_handles_reacquired_total",
        "Writable handles swapped after a write reached a replica"
    )
    .expect("failed to register blob_store_handles_reacquired_total");
    static ref CHUNKS_DELETED: IntCounter = register_int_counter!(
        "blob_store_chunks_deleted_total",
        "Chunk keys removed by deletes"
    )
    .expect("failed to register blob_store_chunks_deleted_total");
    static ref BYTES_SENT: IntCounter = register_int_counter!(
        "blob_store_bytes_sent_total",
        "Bytes returned by retrieves"
    )
    .expect("failed to register blob_store_bytes_sent_total");
    static ref BYTES_RECEIVED: IntCounter = register_int_counter!(
        "blob_store_bytes_received_total",
        "Bytes accepted by stores"
    )
    .expect("failed to register blob_store_bytes_received_total");
    static ref FALLBACK_USED: IntCounter = register_int_counter!(
        "blob_store_fallback_used_total",
        "Operations served by the local fallback"
    )
    .expect("failed to register blob_store_fallback_used_total");
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsCollector for PrometheusMetrics {
    fn chunk_written(&self) {
        CHUNKS_WRITTEN.inc();
    }

    fn chunk_write_error(&self) {
        CHUNK_WRITE_ERRORS.inc();
    }

    fn chunk_write_retried(&self) {
        CHUNK_WRITE_RETRIES.inc();
    }

    fn handle_reacquired(&self) {
        HANDLES_REACQUIRED.inc();
    }

    fn chunks_deleted(&self, amount: u64) {
        CHUNKS_DELETED.inc_by(amount);
    }

    fn bytes_sent(&self, amount: usize) {
        BYTES_SENT.inc_by(amount as u64);
    }

    fn bytes_received(&self, amount: usize) {
        BYTES_RECEIVED.inc_by(amount as u64);
    }

    fn fallback_used(&self) {
        FALLBACK_USED.inc();
    }
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
