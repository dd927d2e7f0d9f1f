use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::{ClusterBackend, RedisCluster};
use crate::keys::{PrefixedKeyPolicy, DEFAULT_KEY_PREFIX};
use crate::retry::RetryPolicy;
use crate::store::{BlobStore, BlobStoreBuilder};
use crate::supervisor::SupervisorConfig;
use crate::types::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Runtime knobs of the chunked read/write paths.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub chunk_size: usize,
    /// Per-chunk (and per metadata write) attempts on transient errors.
    pub chunk_retry: RetryPolicy,
    pub read_retry: RetryPolicy,
    /// How often a single store or delete may swap its handle after
    /// hitting a replica.
    pub max_reacquisitions: u32,
    pub scan_timeout: Duration,
    pub scan_batch: usize,
    /// Local fallback storage and retrieve-to-path output.
    pub fallback_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retry: RetryPolicy::fixed(3, Duration::from_millis(250)),
            read_retry: RetryPolicy::exponential(3, Duration::from_millis(50), Duration::from_secs(1)),
            max_reacquisitions: 3,
            scan_timeout: Duration::from_secs(10),
            scan_batch: 500,
            fallback_dir: default_fallback_dir(),
        }
    }
}

pub fn default_fallback_dir() -> PathBuf {
    std::env::temp_dir().join("shared-blob-store")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// File-level configuration (TOML). Every field has a default, so an empty
/// file describes a store running on the local fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis endpoints, e.g. `redis://10.0.0.1:6379/`. Empty means no cluster.
    pub redis_endpoints: Vec<String>,
    pub key_prefix: String,
    pub chunk_size: usize,
    pub default_ttl_secs: u64,
    pub canary_ttl_secs: u64,
    pub fallback_dir: Option<PathBuf>,
    pub command_timeout_ms: u64,
    pub canary_timeout_ms: u64,
    pub connect_attempts: u32,
    pub connect_base_delay_ms: u64,
    pub canary_attempts: u32,
    pub canary_base_delay_ms: u64,
    pub chunk_attempts: u32,
    pub chunk_retry_delay_ms: u64,
    pub read_attempts: u32,
    pub read_base_delay_ms: u64,
    pub max_reacquisitions: u32,
    pub scan_timeout_ms: u64,
    pub scan_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_endpoints: Vec::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_ttl_secs: 24 * 60 * 60,
            canary_ttl_secs: 10,
            fallback_dir: None,
            command_timeout_ms: 5_000,
            canary_timeout_ms: 5_000,
            connect_attempts: 5,
            connect_base_delay_ms: 200,
            canary_attempts: 3,
            canary_base_delay_ms: 100,
            chunk_attempts: 3,
            chunk_retry_delay_ms: 250,
            read_attempts: 3,
            read_base_delay_ms: 50,
            max_reacquisitions: 3,
            scan_timeout_ms: 10_000,
            scan_batch: 500,
        }
    }
}

impl StoreConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".to_string()));
        }
        if self.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid("default_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            chunk_size: self.chunk_size,
            chunk_retry: RetryPolicy::fixed(
                self.chunk_attempts,
                Duration::from_millis(self.chunk_retry_delay_ms),
            ),
            read_retry: RetryPolicy::exponential(
                self.read_attempts,
                Duration::from_millis(self.read_base_delay_ms),
                Duration::from_secs(1),
            ),
            max_reacquisitions: self.max_reacquisitions,
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            scan_batch: self.scan_batch.max(1),
            fallback_dir: self.fallback_dir.clone().unwrap_or_else(default_fallback_dir),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_retry: RetryPolicy::exponential(
                self.connect_attempts,
                Duration::from_millis(self.connect_base_delay_ms),
                Duration::from_secs(5),
            ),
            canary_retry: RetryPolicy::exponential(
                self.canary_attempts,
                Duration::from_millis(self.canary_base_delay_ms),
                Duration::from_secs(2),
            ),
            canary_timeout: Duration::from_millis(self.canary_timeout_ms),
        }
    }

    pub fn key_policy(&self) -> PrefixedKeyPolicy {
        PrefixedKeyPolicy::new(self.key_prefix.clone())
            .with_file_ttl(Duration::from_secs(self.default_ttl_secs))
            .with_canary_ttl(Duration::from_secs(self.canary_ttl_secs))
    }

    /// The Redis backend, or `None` when no endpoint is configured.
    pub fn redis_backend(&self) -> Option<Arc<dyn ClusterBackend>> {
        if self.redis_endpoints.is_empty() {
            return None;
        }
        let backend = RedisCluster::new(self.redis_endpoints.clone())
            .with_command_timeout(Duration::from_millis(self.command_timeout_ms));
        Some(Arc::new(backend))
    }

    /// Builder preloaded with everything this config describes except the backend.
    pub fn builder(&self) -> Result<BlobStoreBuilder, ConfigError> {
        self.validate()?;
        Ok(BlobStore::builder()
            .key_policy(Arc::new(self.key_policy()))
            .settings(self.settings())
            .supervisor_config(self.supervisor_config()))
    }

    /// Store wired to Redis, or to the local fallback without endpoints.
    pub fn build(&self) -> Result<BlobStore, ConfigError> {
        let mut builder = self.builder()?;
        if let Some(backend) = self.redis_backend() {
            builder = builder.backend(backend);
        }
        Ok(builder.build())
    }
}
