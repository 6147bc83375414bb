//! DipBot binary entrypoint
//!
//! Wires configuration, logging and the engine loop. The order transport
//! and market-data feeds are external collaborators; in dry-run mode the
//! outbound intents are drained and logged so the decision layer can run
//! against any feed wired onto the event channel.

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dipbot::config::AppConfig;
use dipbot::engine::StrategyEngine;
use dipbot::types::{EngineEvent, OrderIntent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    info!(config = %config.digest(), "dipbot starting");

    let (intent_tx, mut intent_rx) = mpsc::unbounded_channel::<OrderIntent>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();

    let dry_run = config.bot.dry_run;
    let mut engine = StrategyEngine::new(config, intent_tx, Utc::now())?;
    engine.load_state(Utc::now());

    // Intent sink: a broker transport consumes these in production; dry-run
    // logs them so the decision layer is observable stand-alone.
    let sink = tokio::spawn(async move {
        while let Some(intent) = intent_rx.recv().await {
            if dry_run {
                info!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    quantity = intent.quantity,
                    urgent = intent.urgent,
                    reason = %intent.reason,
                    "dry-run intent"
                );
            } else {
                warn!(
                    symbol = %intent.symbol,
                    "no order transport wired, dropping intent"
                );
            }
        }
    });

    let engine_task = tokio::spawn(engine.run(event_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // Closing the event channel drains the engine loop, which saves state.
    drop(event_tx);
    engine_task.await?;
    sink.abort();

    Ok(())
}
