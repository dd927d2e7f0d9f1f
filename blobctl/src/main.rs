use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shared_blob_store::BlobId;

mod commands;
mod metrics;

#[derive(Parser)]
#[command(version, about = "Store, fetch and inspect blobs in the shared blob store")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Print Prometheus metrics to stderr when done")]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

/// Where the store lives; every flag overrides the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    #[arg(long, global = true, help = "TOML config file")]
    pub config: Option<PathBuf>,

    #[arg(
        long = "redis",
        global = true,
        env = "BLOBCTL_REDIS",
        value_delimiter = ',',
        help = "Redis endpoint, e.g. redis://10.0.0.1:6379/ (repeatable)"
    )]
    pub redis: Vec<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        help = "Backend override; defaults to redis when endpoints are configured, else local"
    )]
    pub backend: Option<BackendKind>,

    #[arg(long, global = true, help = "Directory used when no cluster is configured")]
    pub fallback_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Configured Redis endpoints
    Redis,
    /// In-process cluster, gone when the command exits (probe only)
    Memory,
    /// Local fallback directory only
    Local,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a file and print its blob id
    Store {
        path: PathBuf,

        #[arg(long, help = "Expiration in seconds (default from the key policy)")]
        ttl_secs: Option<u64>,
    },

    /// Retrieve a blob into a file
    Retrieve {
        blob_id: BlobId,

        #[arg(long, help = "Destination; a fresh temp file when omitted")]
        output: Option<PathBuf>,
    },

    /// Delete a blob
    Delete { blob_id: BlobId },

    /// Check whether a blob exists
    Exists { blob_id: BlobId },

    /// List stored blob ids
    List,

    /// Show cluster endpoints and the node writes would go to
    Probe,
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    run(cli)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    commands::check_backend(&cli.store, &cli.command)?;
    let config = commands::load_config(&cli.store)?;
    let store = commands::build_store(&cli.store, &config)?;

    let output = commands::execute(&store, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if cli.print_metrics {
        eprint!("{}", metrics::render()?);
    }
    Ok(())
}
