mod config;
mod history;
mod pool;
mod proxy;
mod server;
mod store;
mod sync;
mod upstream;

use clap::Parser;
use config::GatewayConfig;
use eyre::{eyre, Result};
use fs2::FileExt;
use history::ChatHistory;
use pool::KeyPool;
use server::AppState;
use std::fs::OpenOptions;
use std::path::PathBuf;
use store::Store;
use sync::KeyFiles;
use upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(
    name = "gemini-gateway",
    version,
    about = "Streaming chat gateway with a tiered API key pool"
)]
struct Args {
    /// Path to the gateway configuration JSON.
    #[arg(long, default_value = "gateway.json")]
    config: PathBuf,

    /// Directory holding freekey.txt, paidkey.txt and api_keys.db.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Override the configured HTTP listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = GatewayConfig::load(&args.config)?;
    let port = args.port.unwrap_or(config.port);

    std::fs::create_dir_all(&args.data_dir).map_err(|e| {
        eyre!(
            "failed to create data directory {}: {e}",
            args.data_dir.display()
        )
    })?;

    // Single-instance guard: two gateways sharing one data directory would
    // fight over the key files and double-count rate limits.
    let lock_path = args.data_dir.join("gateway.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "gateway already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let store = Store::open(args.data_dir.join("api_keys.db"))?;
    let files = KeyFiles::in_dir(&args.data_dir);
    let pool = KeyPool::new(store, files, config.pool_options())?;
    let history = ChatHistory::new(config.base_prompt.clone());
    let upstream = UpstreamClient::new(config.base_url.clone())?;

    tracing::info!(
        port,
        config = %args.config.display(),
        data_dir = %args.data_dir.display(),
        models = ?config.models,
        "gateway starting"
    );

    let state = AppState::new(pool, history, upstream, config);
    server::run(state, port).await
}
