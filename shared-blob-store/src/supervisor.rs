//! Connection supervisor.
//!
//! Hands out connections that reach a master node. A handle is verified by a
//! canary write; when the canary keeps failing the handle is still returned,
//! flagged unverified, and the write paths re-acquire on a read-only error.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ClusterBackend, Endpoint, KvNode};
use crate::clock::Clock;
use crate::error::{BackendError, BlobError};
use crate::keys::{KeyKind, KeyPolicy};
use crate::retry::{pause, retry, RetryError, RetryPolicy};

pub const DEFAULT_CANARY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Reconnection attempts while the client reports disconnected.
    pub connect_retry: RetryPolicy,
    /// Canary attempts before settling for an unverified handle.
    pub canary_retry: RetryPolicy,
    pub canary_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            canary_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(100),
                Duration::from_secs(2),
            ),
            canary_timeout: DEFAULT_CANARY_TIMEOUT,
        }
    }
}

/// Connection to a node believed to accept writes.
#[derive(Clone)]
pub struct WritableHandle {
    node: Arc<dyn KvNode>,
    verified: bool,
}

impl WritableHandle {
    pub fn node(&self) -> &Arc<dyn KvNode> {
        &self.node
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.node.endpoint()
    }

    /// False when no canary write succeeded; writes may still hit a replica.
    pub fn is_verified(&self) -> bool {
        self.verified
    }
}

impl std::fmt::Debug for WritableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableHandle")
            .field("endpoint", self.endpoint())
            .field("verified", &self.verified)
            .finish()
    }
}

/// Outcome of a writable acquisition.
#[derive(Debug)]
pub enum Acquisition {
    /// No cluster is configured: callers use the local fallback.
    Fallback,
    Handle(WritableHandle),
}

/// Snapshot used by operators to check the wiring.
#[derive(Debug, Clone)]
pub struct TopologyReport {
    pub endpoints: Vec<Endpoint>,
    pub selected: Option<Endpoint>,
    pub verified: bool,
}

pub struct ConnectionSupervisor {
    backend: Option<Arc<dyn ClusterBackend>>,
    keys: Arc<dyn KeyPolicy>,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(
        backend: Option<Arc<dyn ClusterBackend>>,
        keys: Arc<dyn KeyPolicy>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            backend,
            keys,
            clock,
            config,
        }
    }

    pub fn backend_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Returns a connection to a master node, or `Fallback` when no cluster
    /// is configured.
    pub async fn acquire_writable_handle(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, BlobError> {
        let Some(backend) = &self.backend else {
            return Ok(Acquisition::Fallback);
        };
        self.ensure_connected(backend.as_ref(), cancel).await?;

        let max_attempts = self.config.canary_retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let node = self.writable_node(backend.as_ref(), cancel).await?;
            let err = match self.canary(node.as_ref()).await {
                Ok(()) => {
                    debug!(endpoint = %node.endpoint(), "canary write succeeded");
                    return Ok(Acquisition::Handle(WritableHandle {
                        node,
                        verified: true,
                    }));
                }
                Err(e) if e.is_read_only() || e.is_transient() => e,
                Err(e) => return Err(BlobError::Backend(e)),
            };

            attempt += 1;
            if attempt >= max_attempts {
                warn!(
                    endpoint = %node.endpoint(),
                    attempts = attempt,
                    error = %err,
                    "canary write never succeeded, continuing with unverified handle"
                );
                return Ok(Acquisition::Handle(WritableHandle {
                    node,
                    verified: false,
                }));
            }

            let delay = self.config.canary_retry.delay_for(attempt - 1);
            debug!(endpoint = %node.endpoint(), attempt, ?delay, error = %err, "canary write failed");
            pause(self.clock.as_ref(), delay, cancel).await?;
        }
    }

    /// Like [`acquire_writable_handle`](Self::acquire_writable_handle) for
    /// callers already committed to the cluster path.
    pub async fn reacquire(&self, cancel: &CancellationToken) -> Result<WritableHandle, BlobError> {
        match self.acquire_writable_handle(cancel).await? {
            Acquisition::Handle(handle) => Ok(handle),
            Acquisition::Fallback => Err(BlobError::NoWritableNode),
        }
    }

    /// A node to read from: a master when there is one, else any replica.
    /// `None` when no cluster is configured.
    pub async fn acquire_readable_node(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn KvNode>>, BlobError> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        self.ensure_connected(backend.as_ref(), cancel).await?;

        let endpoints = self.endpoints(backend.as_ref(), cancel).await?;
        let endpoint = endpoints
            .iter()
            .find(|e| !e.is_replica())
            .or_else(|| endpoints.first())
            .ok_or_else(|| BlobError::BackendUnavailable {
                attempts: 1,
                source: BackendError::Connection("cluster reports no endpoints".to_string()),
            })?;
        let node = backend.node(endpoint).await?;
        Ok(Some(node))
    }

    /// Topology plus the outcome of a fresh acquisition. `None` in fallback mode.
    pub async fn describe(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<TopologyReport>, BlobError> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        self.ensure_connected(backend.as_ref(), cancel).await?;
        let endpoints = self.endpoints(backend.as_ref(), cancel).await?;

        let (selected, verified) = match self.acquire_writable_handle(cancel).await {
            Ok(Acquisition::Handle(handle)) => (Some(handle.endpoint().clone()), handle.is_verified()),
            Ok(Acquisition::Fallback) | Err(BlobError::NoWritableNode) => (None, false),
            Err(e) => return Err(e),
        };
        Ok(Some(TopologyReport {
            endpoints,
            selected,
            verified,
        }))
    }

    async fn ensure_connected(
        &self,
        backend: &dyn ClusterBackend,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError> {
        if backend.is_connected() {
            return Ok(());
        }
        debug!("cluster client disconnected, reconnecting");
        retry(
            &self.config.connect_retry,
            self.clock.as_ref(),
            cancel,
            "connect",
            || backend.connect(),
        )
        .await
        .map_err(unavailable)
    }

    async fn endpoints(
        &self,
        backend: &dyn ClusterBackend,
        cancel: &CancellationToken,
    ) -> Result<Vec<Endpoint>, BlobError> {
        retry(
            &self.config.connect_retry,
            self.clock.as_ref(),
            cancel,
            "list endpoints",
            || backend.endpoints(),
        )
        .await
        .map_err(unavailable)
    }

    async fn writable_node(
        &self,
        backend: &dyn ClusterBackend,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn KvNode>, BlobError> {
        let endpoints = self.endpoints(backend, cancel).await?;
        let Some(endpoint) = endpoints.into_iter().find(|e| !e.is_replica()) else {
            warn!("every cluster endpoint reports the replica role");
            return Err(BlobError::NoWritableNode);
        };
        Ok(backend.node(&endpoint).await?)
    }

    async fn canary(&self, node: &dyn KvNode) -> Result<(), BackendError> {
        let key = self
            .keys
            .create_key(KeyKind::Canary.namespace(), &Uuid::new_v4().simple().to_string());
        let ttl = self.keys.expiration_for_key_type(KeyKind::Canary);
        match tokio::time::timeout(
            self.config.canary_timeout,
            node.set(&key, Bytes::from_static(b"1"), Some(ttl)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "canary write to {} exceeded {:?}",
                node.endpoint(),
                self.config.canary_timeout
            ))),
        }
    }
}

fn unavailable(err: RetryError) -> BlobError {
    match err {
        RetryError::Exhausted { attempts, last } => BlobError::BackendUnavailable {
            attempts,
            source: last,
        },
        RetryError::Fatal(source) => BlobError::BackendUnavailable {
            attempts: 1,
            source,
        },
        RetryError::Cancelled => BlobError::Cancelled,
    }
}
