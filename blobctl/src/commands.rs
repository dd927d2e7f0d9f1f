use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use shared_blob_store::{
    BlobId, BlobStore, MemoryCluster, StoreConfig, SystemClock, TopologyReport,
};

use crate::metrics::PrometheusMetrics;
use crate::{BackendKind, Command, StoreArgs};

/// Printed as JSON on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Output {
    Store {
        blob_id: String,
        source: PathBuf,
    },
    Retrieve {
        blob_id: String,
        path: PathBuf,
        size: usize,
        extension: String,
    },
    Delete {
        blob_id: String,
    },
    Exists {
        blob_id: String,
        exists: bool,
    },
    List {
        count: usize,
        blob_ids: Vec<String>,
    },
    Probe {
        mode: &'static str,
        endpoints: Vec<EndpointOutput>,
        selected: Option<String>,
        verified: bool,
    },
}

#[derive(Debug, Serialize)]
pub struct EndpointOutput {
    address: String,
    role: String,
}

/// Config file (if any) with command-line overrides applied.
pub fn load_config(args: &StoreArgs) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };

    if !args.redis.is_empty() {
        config.redis_endpoints = args.redis.clone();
    }
    if let Some(dir) = &args.fallback_dir {
        config.fallback_dir = Some(dir.clone());
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(prefix) = &args.key_prefix {
        config.key_prefix = prefix.clone();
    }

    config.validate()?;
    Ok(config)
}

/// The in-process cluster is gone once the command exits, so nothing but a
/// probe can observe it.
pub fn check_backend(args: &StoreArgs, command: &Command) -> Result<()> {
    if args.backend == Some(BackendKind::Memory) && !matches!(command, Command::Probe) {
        bail!("--backend memory keeps nothing between invocations and only supports probe");
    }
    Ok(())
}

pub fn build_store(args: &StoreArgs, config: &StoreConfig) -> Result<BlobStore> {
    let builder = config.builder()?.metrics(Arc::new(PrometheusMetrics));

    let builder = match args.backend {
        Some(BackendKind::Memory) => {
            info!("using in-process memory cluster");
            builder.backend(Arc::new(MemoryCluster::new(Arc::new(SystemClock))))
        }
        Some(BackendKind::Redis) => {
            let Some(backend) = config.redis_backend() else {
                bail!("--backend redis needs at least one --redis endpoint");
            };
            builder.backend(backend)
        }
        Some(BackendKind::Local) => builder,
        None => match config.redis_backend() {
            Some(backend) => builder.backend(backend),
            None => builder,
        },
    };

    let store = builder.build();
    if store.is_fallback() {
        debug!(dir = %store.settings().fallback_dir.display(), "no cluster configured, using local fallback");
    }
    Ok(store)
}

pub async fn execute(store: &BlobStore, command: Command) -> Result<Output> {
    let output = match command {
        Command::Store { path, ttl_secs } => {
            let ttl = ttl_secs.map(Duration::from_secs);
            let blob_id = store
                .store_file_from_path(&path, ttl)
                .await
                .with_context(|| format!("storing {}", path.display()))?;
            Output::Store {
                blob_id: blob_id.to_string(),
                source: path,
            }
        }
        Command::Retrieve { blob_id, output } => retrieve(store, blob_id, output).await?,
        Command::Delete { blob_id } => {
            store.delete_file(&blob_id).await?;
            Output::Delete {
                blob_id: blob_id.to_string(),
            }
        }
        Command::Exists { blob_id } => Output::Exists {
            blob_id: blob_id.to_string(),
            exists: store.file_exists(&blob_id).await,
        },
        Command::List => {
            let blob_ids: Vec<String> = store
                .list_files()
                .await?
                .iter()
                .map(ToString::to_string)
                .collect();
            Output::List {
                count: blob_ids.len(),
                blob_ids,
            }
        }
        Command::Probe => {
            let cancel = tokio_util::sync::CancellationToken::new();
            match store.supervisor().describe(&cancel).await? {
                Some(report) => probe_output(report),
                None => Output::Probe {
                    mode: "local",
                    endpoints: Vec::new(),
                    selected: None,
                    verified: false,
                },
            }
        }
    };
    Ok(output)
}

async fn retrieve(store: &BlobStore, blob_id: BlobId, output: Option<PathBuf>) -> Result<Output> {
    let (path, size, extension) = match output {
        Some(path) => {
            let blob = store.retrieve_file(&blob_id).await?;
            tokio::fs::write(&path, &blob.data)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            (path, blob.len(), blob.extension)
        }
        None => {
            let path = store.retrieve_file_to_path(&blob_id).await?;
            let size = tokio::fs::metadata(&path).await?.len() as usize;
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{ext}"))
                .unwrap_or_default();
            (path, size, extension)
        }
    };
    Ok(Output::Retrieve {
        blob_id: blob_id.to_string(),
        path,
        size,
        extension,
    })
}

fn probe_output(report: TopologyReport) -> Output {
    Output::Probe {
        mode: "cluster",
        endpoints: report
            .endpoints
            .iter()
            .map(|e| EndpointOutput {
                address: e.address.clone(),
                role: e.role.to_string(),
            })
            .collect(),
        selected: report.selected.map(|e| e.address),
        verified: report.verified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_args(dir: &std::path::Path) -> StoreArgs {
        StoreArgs {
            backend: Some(BackendKind::Local),
            fallback_dir: Some(dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "key_prefix = \"file\"\nchunk_size = 1024\n").unwrap();

        let args = StoreArgs {
            config: Some(path),
            key_prefix: Some("cli".to_string()),
            redis: vec!["redis://127.0.0.1:6379/".to_string()],
            ..Default::default()
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.key_prefix, "cli");
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.redis_endpoints.len(), 1);
    }

    #[test]
    fn test_redis_backend_requires_endpoint() {
        let args = StoreArgs {
            backend: Some(BackendKind::Redis),
            ..Default::default()
        };
        let config = load_config(&args).unwrap();
        assert!(build_store(&args, &config).is_err());
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let args = local_args(dir.path());
        let store = build_store(&args, &load_config(&args).unwrap()).unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, b"hello").unwrap();

        let Output::Store { blob_id, .. } = execute(
            &store,
            Command::Store {
                path: source,
                ttl_secs: None,
            },
        )
        .await
        .unwrap() else {
            panic!("expected store output");
        };
        let blob_id: BlobId = blob_id.parse().unwrap();

        let target = dir.path().join("out.txt");
        let Output::Retrieve { size, extension, .. } = execute(
            &store,
            Command::Retrieve {
                blob_id,
                output: Some(target.clone()),
            },
        )
        .await
        .unwrap() else {
            panic!("expected retrieve output");
        };
        assert_eq!(size, 5);
        assert_eq!(extension, ".txt");
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        let Output::Probe { mode, .. } = execute(&store, Command::Probe).await.unwrap() else {
            panic!("expected probe output");
        };
        assert_eq!(mode, "local");
    }

    #[test]
    fn test_memory_backend_is_probe_only() {
        let args = StoreArgs {
            backend: Some(BackendKind::Memory),
            ..Default::default()
        };
        assert!(check_backend(&args, &Command::Probe).is_ok());
        assert!(check_backend(&args, &Command::List).is_err());
        assert!(check_backend(
            &args,
            &Command::Store {
                path: PathBuf::from("notes.txt"),
                ttl_secs: None,
            }
        )
        .is_err());

        let local = StoreArgs::default();
        assert!(check_backend(&local, &Command::List).is_ok());
    }

    #[tokio::test]
    async fn test_memory_probe() {
        let dir = tempfile::tempdir().unwrap();
        let args = StoreArgs {
            backend: Some(BackendKind::Memory),
            fallback_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = build_store(&args, &load_config(&args).unwrap()).unwrap();

        let Output::Probe {
            mode,
            endpoints,
            selected,
            verified,
        } = execute(&store, Command::Probe).await.unwrap()
        else {
            panic!("expected probe output");
        };
        assert_eq!(mode, "cluster");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(selected.as_deref(), Some("memory-0"));
        assert!(verified);
    }
}
