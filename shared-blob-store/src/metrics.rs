use std::sync::Arc;

/// Shared metrics collector interface
///
/// Applications plug in their own implementation (Prometheus, StatsD, ...).
/// The store only ever talks to it through [`SharedMetrics`].
pub trait MetricsCollector: Send + Sync {
    fn chunk_written(&self);
    fn chunk_write_error(&self);
    fn chunk_write_retried(&self);
    fn handle_reacquired(&self);
    fn chunks_deleted(&self, amount: u64);
    fn bytes_sent(&self, amount: usize);
    fn bytes_received(&self, amount: usize);
    fn fallback_used(&self);
}

/// No-op metrics collector (default)
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn chunk_written(&self) {}
    fn chunk_write_error(&self) {}
    fn chunk_write_retried(&self) {}
    fn handle_reacquired(&self) {}
    fn chunks_deleted(&self, _amount: u64) {}
    fn bytes_sent(&self, _amount: usize) {}
    fn bytes_received(&self, _amount: usize) {}
    fn fallback_used(&self) {}
}

/// Shared reference to metrics collector
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn chunk_written(&self) {
        self.0.chunk_written();
    }

    pub fn chunk_write_error(&self) {
        self.0.chunk_write_error();
    }

    pub fn chunk_write_retried(&self) {
        self.0.chunk_write_retried();
    }

    pub fn handle_reacquired(&self) {
        self.0.handle_reacquired();
    }

    pub fn chunks_deleted(&self, amount: u64) {
        self.0.chunks_deleted(amount);
    }

    pub fn bytes_sent(&self, amount: usize) {
        self.0.bytes_sent(amount);
    }

    pub fn bytes_received(&self, amount: usize) {
        self.0.bytes_received(amount);
    }

    pub fn fallback_used(&self) {
        self.0.fallback_used();
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}
