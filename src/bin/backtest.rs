// =============================================================================
// Backtest CLI — replay the settlement-arbitrage rules over a date range
// =============================================================================
//
// Run: cargo run --bin backtest -- 2025-01-01 2025-12-31 [IM0,IC0]
//
// Daily data comes from the Sina adapter; minute snapshots under the data
// directory (when present) refine the 14:30 base price. Prints the full
// JSON report to stdout and a short summary to the log.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cffex_settle::backtest::SettlementStrategyBacktest;
use cffex_settle::config::{BacktestConfig, EngineConfig, StrategyConfig};
use cffex_settle::market_data::BarStore;
use cffex_settle::provider::SinaProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: backtest <start YYYY-MM-DD> <end YYYY-MM-DD> [symbols,comma,separated]");
    }

    let start = NaiveDate::parse_from_str(&args[0], "%Y-%m-%d").context("bad start date")?;
    let end = NaiveDate::parse_from_str(&args[1], "%Y-%m-%d").context("bad end date")?;
    if end < start {
        bail!("end date is before start date");
    }

    let engine_config = EngineConfig::load("engine_config.json").unwrap_or_default();
    let mut strategy_config = StrategyConfig {
        symbols: engine_config.strategy.symbols.clone(),
        ..engine_config.strategy.clone()
    };
    if let Some(symbols) = args.get(2) {
        strategy_config.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let backtest_config = BacktestConfig::default();

    info!(
        start = %start,
        end = %end,
        symbols = ?strategy_config.symbols,
        "running backtest"
    );

    let provider = Arc::new(SinaProvider::new());
    let store = BarStore::new(&engine_config.data_dir);
    let engine = SettlementStrategyBacktest::new(provider, store);

    let report = engine
        .run(start, end, &strategy_config, &backtest_config)
        .await?;

    info!(
        trades = report.total_trades,
        win_rate = format!("{:.1}%", report.win_rate * 100.0),
        total_return = format!("{:.2}%", report.total_return * 100.0),
        max_drawdown = format!("{:.2}%", report.max_drawdown * 100.0),
        sharpe = format!("{:.2}", report.sharpe_ratio),
        "backtest finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
