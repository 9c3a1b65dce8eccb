use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tangle_archive::api;
use tangle_archive::cache::HistoryCache;
use tangle_archive::config::NodeConfig;
use tangle_archive::db::Database;

#[derive(Parser)]
#[command(author, version, about = "Read-only REST API over a finalized ledger dataset")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start serving the dataset using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/archive.toml")]
        config: PathBuf,
    },
    /// Generate a default configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/archive.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
    }

    Ok(())
}

async fn start(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::load(&config_path)?;

    // The startup rebuild can take a while on a cold dataset; a ctrl-c during
    // that window cancels it instead of leaving the process hanging.
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_watcher = cancel.clone();
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            cancel_watcher.store(true, Ordering::Relaxed);
            let _ = shutdown_tx.send(());
        }
    });

    let open_config = config.clone();
    let open_cancel = cancel.clone();
    let db = tokio::task::spawn_blocking(move || Database::open(&open_config, &open_cancel)).await??;
    let db = Arc::new(db);
    let cache = Arc::new(HistoryCache::new(config.cache_capacity));
    info!(
        network = %config.network_name,
        ledger_index = db.utxo().read_ledger_index()?,
        "dataset opened"
    );

    tokio::select! {
        result = api::serve(db, cache, &config) => result?,
        _ = &mut shutdown_rx => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}
