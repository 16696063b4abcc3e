// =============================================================================
// cffex-settle — Live Engine Entry Point
// =============================================================================
//
// Starts the settlement-arbitrage scheduler against the Sina data adapter
// and runs until Ctrl+C. Notifications go to the log sink by default;
// concrete transports plug in behind `NotificationSink`.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cffex_settle::clock::SystemClock;
use cffex_settle::config::EngineConfig;
use cffex_settle::notify::LogSink;
use cffex_settle::provider::SinaProvider;
use cffex_settle::scheduler::create_scheduler;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("cffex-settle starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(symbols) = std::env::var("SETTLE_SYMBOLS") {
        config.strategy.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    config.validate()?;
    info!(
        symbols = ?config.strategy.symbols,
        threshold_1 = config.strategy.threshold_1,
        threshold_2 = config.strategy.threshold_2,
        "configuration loaded"
    );

    // ── 2. Build components and start ────────────────────────────────────
    let provider = Arc::new(SinaProvider::new());
    let sink = Arc::new(LogSink);
    let clock = Arc::new(SystemClock);

    let scheduler = create_scheduler(provider, sink, config.clone(), clock).await;
    scheduler.start()?;

    info!("engine running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    scheduler.stop().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("cffex-settle shut down complete");
    Ok(())
}
