//! # colonyd: Colony scheduling daemon
//!
//! Opens the configured store and runs the generator, cron and graph reconcile
//! sweeps until Ctrl-C.
//!
//! Usage:
//!   colonyd                          # ~/.colony/config.toml, SQLite store
//!   colonyd --config colony.toml     # Explicit config file
//!   colonyd --memory --verbose       # Throwaway in-memory store, debug logs

use anyhow::Result;
use clap::Parser;
use colony_core::ColonyConfig;
use colony_scheduler::ColonyEngine;
use colony_store::{Backend, sqlite};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colonyd", version, about = "🐜 Colony: process scheduling daemon")]
struct Cli {
    /// Config file (defaults to ~/.colony/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Use the in-memory store regardless of config
    #[arg(long)]
    memory: bool,
}

fn init_logging(config: &ColonyConfig, cli: &Cli) {
    let level = if cli.verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("colonyd={level},colony_scheduler={level},colony_store={level}"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if cli.json || config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ColonyConfig::load_from(path)?,
        None => ColonyConfig::load()?,
    };
    init_logging(&config, &cli);

    if cli.memory {
        config.database.backend = "memory".into();
    }
    let backend = Backend::open(&config.database)?;
    tracing::info!("🗄️ Store backend: {}", backend.name());
    if let Backend::Sqlite(store) = &backend {
        for (state, count) in sqlite::state_counts(store)? {
            tracing::info!("   {} processes: {}", state, count);
        }
    }

    let engine = ColonyEngine::new(backend.stores(), &config);
    tracing::info!(
        "🐜 Colony engine ready (generator every {:?}, cron every {:?}, reconcile every {:?}, policy {:?})",
        engine.generators.generator_period(),
        engine.crons.cron_period(),
        config.reconcile.period(),
        config.scheduler.selection_policy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.spawn_sweeps(&config, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    shutdown_tx.send(true)?;
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("❌ Sweep task ended abnormally: {e}");
        }
    }
    Ok(())
}
