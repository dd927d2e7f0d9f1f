//! # Shared Blob Store
//!
//! Chunked storage of arbitrary-size binary files on a clustered key-value
//! cache (Redis master/replica sets), with a local-disk fallback when no
//! cluster is configured.
//!
//! ## Features
//!
//! - **Chunked Layout**: Files split into 1 MiB chunks keyed by byte offset, plus a metadata hash
//! - **Completion Marker**: The recorded size is written last; readers trust nothing else
//! - **Master Discovery**: Writable node picked from the topology and verified with a canary write
//! - **Failover Resumption**: Writes that hit a freshly demoted master re-acquire a handle and resume
//! - **Best-Effort Cleanup**: Failed writes and deletes remove what they can and report the rest
//! - **Local Fallback**: Whole-file storage in a temp directory, same contracts minus expiry
//!
//! ## Example
//!
//! ```no_run
//! use shared_blob_store::{BlobStore, StoreConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig {
//!     redis_endpoints: vec!["redis://127.0.0.1:6379/".to_string()],
//!     ..Default::default()
//! };
//! let store: BlobStore = config.build()?;
//!
//! let mut source = &b"%PDF-1.7 ..."[..];
//! let id = store
//!     .store_file(&mut source, Some(".pdf"), Some(Duration::from_secs(3600)))
//!     .await?;
//!
//! let blob = store.retrieve_file(&id).await?;
//! assert_eq!(blob.extension, ".pdf");
//!
//! store.delete_file(&id).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod reader;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod writer;

pub use backend::{ClusterBackend, Endpoint, KvNode, MemoryCluster, NodeRole, RedisCluster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, StoreConfig, StoreSettings};
pub use error::{BackendError, BlobError};
pub use keys::{KeyKind, KeyPolicy, PrefixedKeyPolicy};
pub use lifecycle::{CleanupOutcome, CleanupReport};
pub use metrics::{MetricsCollector, NoOpMetrics, SharedMetrics};
pub use retry::{Backoff, RetryPolicy};
pub use store::{BlobStore, BlobStoreBuilder};
pub use supervisor::{Acquisition, ConnectionSupervisor, SupervisorConfig, TopologyReport};
pub use types::{BlobId, FileMetadata, RetrievedBlob, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
