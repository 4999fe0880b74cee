//! shield-edge binary — runtime shell
//!
//! The production deployment wires real protocol adapters and the config
//! layer around [`EdgeRuntime`]; this binary starts the core with the
//! value-struct defaults (plus `DB_PATH` / `LOG_LEVEL` overrides) so the
//! store, buffer writers, aligner and API surface run standalone.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shield_edge::{CollectorClients, EdgeConfig, EdgeRuntime};

#[derive(Parser, Debug)]
#[command(name = "shield-edge", about = "Edge data pipeline core for shield tunneling machines")]
struct Args {
    /// Database file path (overrides DB_PATH).
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Poison directory for batches that failed to persist.
    #[arg(long)]
    poison_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // LOG_LEVEL drives the filter; RUST_LOG still wins when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = EdgeConfig::default();
    if let Some(path) = args
        .db_path
        .or_else(|| std::env::var("DB_PATH").ok().map(Into::into))
    {
        config.store.path = path;
    }
    if let Some(dir) = args.poison_dir {
        config.buffer.poison_dir = dir;
    }

    let runtime = EdgeRuntime::start(config, CollectorClients::default()).await?;

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}
