//! Raffle settlement worker

use anyhow::Context;
use ledger_core::Ledger;
use raffle_engine::{Config, OsRandom, RaffleEngine, RocksRaffleStore, Scheduler};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    let ledger = Arc::new(Ledger::open(config.ledger.clone()).context("opening ledger")?);
    let store = Arc::new(RocksRaffleStore::open(&config).context("opening raffle store")?);
    let engine = Arc::new(RaffleEngine::new(
        ledger.clone(),
        store,
        Arc::new(OsRandom),
        config.clone(),
    )?);
    let scheduler = Arc::new(Scheduler::new(engine, ledger, config.scheduler.clone()));

    info!(service = %config.service_name, "Raffle scheduler starting");

    tokio::select! {
        _ = scheduler.start() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }
    Ok(())
}
