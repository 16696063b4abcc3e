// =============================================================================
// cffex-settle — intraday settlement-arbitrage engine for CFFEX index futures
// =============================================================================
//
// Watches IC/IM/IF/IH main contracts during the 14:30-15:00 settlement window,
// enters long when the price drops below configurable thresholds from the
// 14:30 base price, and flattens at the next trading day's open.

pub mod backtest;
pub mod clock;
pub mod config;
pub mod market_data;
pub mod notify;
pub mod position;
pub mod provider;
pub mod risk;
pub mod scheduler;
pub mod strategy;
pub mod types;
pub mod vwap;
