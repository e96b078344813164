//! speedprobe command-line entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use speedprobe_transfer::UploadStorage;
use tracing_subscriber::EnvFilter;

/// Measure HTTP download and upload throughput.
#[derive(Parser)]
#[command(name = "speedprobe", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP proxy as host:port or http://host:port
    #[arg(long)]
    pub proxy: Option<String>,

    /// Socket timeout in milliseconds (0 disables it)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download a resource and measure the rate
    Download {
        /// http:// URI to download
        uri: String,
        /// Stop after this many milliseconds and report what was received
        #[arg(long)]
        max_duration_ms: Option<u64>,
    },
    /// Upload random data and measure the rate
    Upload {
        /// http:// URI to POST to
        uri: String,
        /// Payload size in bytes
        #[arg(short, long)]
        size: Option<u64>,
        /// Stop after this many milliseconds and report what was sent
        #[arg(long)]
        max_duration_ms: Option<u64>,
        /// Where the payload is kept while sending
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,
        /// Upload chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Repeat a transfer over a time window and report the average rate
    Repeat {
        /// http:// URI to download from, or upload to with --upload-size
        uri: String,
        /// Upload this many bytes per iteration instead of downloading
        #[arg(long)]
        upload_size: Option<u64>,
        /// Window length in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,
        /// Report interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Let the running iteration finish when the window closes
        #[arg(long)]
        finish_in_flight: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum StorageArg {
    Ram,
    TempFile,
}

impl From<StorageArg> for UploadStorage {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Ram => UploadStorage::Ram,
            StorageArg::TempFile => UploadStorage::TempFile,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting speedprobe");

    let config = config::Config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli, config))
}
