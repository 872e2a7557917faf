use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use lodekv::store::Compactor;
use lodekv::{KvStore, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "lodekv-db")]
#[command(about = "Segmented key-value store with an HTTP surface")]
struct Args {
    /// Data directory (falls back to DB_DIR, then ./data)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Listen port (falls back to DB_PORT, then 8070)
    #[arg(long)]
    port: Option<u16>,

    /// Segment rotation threshold in bytes (0 disables rotation)
    #[arg(long)]
    max_segment_bytes: Option<u64>,

    /// Interval between background compaction passes, in milliseconds
    #[arg(long)]
    merge_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dir = args
        .dir
        .or_else(|| std::env::var("DB_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./data"));
    let port = args
        .port
        .or_else(|| std::env::var("DB_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8070);

    let mut config = StoreConfig::from_env();
    if let Some(bytes) = args.max_segment_bytes {
        config.max_segment_bytes = bytes;
    }
    if let Some(ms) = args.merge_interval_ms {
        config.merge_interval = Duration::from_millis(ms);
    }

    let store = KvStore::open(&dir, config)
        .with_context(|| format!("failed to open store at {}", dir.display()))?;
    let compactor = Compactor::start(store.clone(), config.merge_interval);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!("store listening on {}", listener.local_addr()?);

    axum::serve(listener, lodekv::http::router(store.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server error")?;

    compactor.stop();
    store.close()?;
    Ok(())
}
