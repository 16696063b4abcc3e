// =============================================================================
// Market Data Provider — abstract capability the engine consumes
// =============================================================================
//
// The core never talks to a vendor directly. Everything it needs from the
// outside world goes through this trait: minute bars, real-time quotes,
// settlement prices, daily klines, and the trading-calendar predicate.
//
// Failure semantics are best-effort: adapters log their own errors and
// return empty/None, so a vendor outage degrades to "no new data" rather
// than propagating through the engine.

pub mod sina;

pub use sina::SinaProvider;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::market_data::MinuteBar;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Real-time quote snapshot for one contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteTick {
    pub symbol: String,
    pub last: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    #[serde(default)]
    pub pre_close: Option<f64>,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    pub amount: f64,
    /// Unix timestamp (seconds) of the snapshot.
    pub timestamp: i64,
}

/// A single kline row from the general-purpose history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineRow {
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Supported kline granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    D1,
}

impl Timeframe {
    /// Minute count for intraday frames; `None` for daily.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Self::M1 => Some(1),
            Self::M5 => Some(5),
            Self::M15 => Some(15),
            Self::M30 => Some(30),
            Self::H1 => Some(60),
            Self::D1 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1H",
            Self::D1 => "1D",
        }
    }
}

// ---------------------------------------------------------------------------
// Trading-session predicates (pure, shared by all adapters)
// ---------------------------------------------------------------------------

/// CFFEX index-futures trading hours: 09:30-11:30 and 13:00-15:00.
pub fn in_trading_session(t: NaiveTime) -> bool {
    let morning_start = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let morning_end = NaiveTime::from_hms_opt(11, 30, 0).unwrap();
    let afternoon_start = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
    let afternoon_end = NaiveTime::from_hms_opt(15, 0, 0).unwrap();

    (morning_start <= t && t <= morning_end) || (afternoon_start <= t && t <= afternoon_end)
}

/// The settlement-arbitrage watch window: 14:30-15:00.
pub fn in_watch_window(t: NaiveTime) -> bool {
    let start = NaiveTime::from_hms_opt(14, 30, 0).unwrap();
    let end = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
    start <= t && t <= end
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Abstract market-data source. Concrete adapters (Sina, a replay source,
/// test mocks) implement the async fetch methods; the session predicates
/// have calendar-unaware defaults an adapter may override.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetch the most recent `count` minute bars for `symbol`.
    /// `period` is the bar size in minutes (1, 5, 15, 30, 60).
    /// With `start_date`, bars before that date are dropped.
    /// Returns an empty vec on failure (the adapter logs the cause).
    async fn get_minute_bars(
        &self,
        symbol: &str,
        period: u32,
        count: usize,
        start_date: Option<NaiveDate>,
    ) -> Vec<MinuteBar>;

    /// Latest quote for a contract, or `None` when unavailable.
    async fn get_realtime_quote(&self, symbol: &str) -> Option<QuoteTick>;

    /// Official settlement price for `symbol` on `date` (latest when `None`).
    async fn get_settlement_price(&self, symbol: &str, date: Option<NaiveDate>) -> Option<f64>;

    /// General-purpose kline history, newest rows last. `limit` is capped
    /// by adapters at 1000; with `before`, only rows strictly earlier are
    /// returned.
    async fn get_kline(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        before: Option<NaiveDateTime>,
    ) -> Vec<KlineRow>;

    /// Calendar-aware trading-day predicate.
    async fn is_trading_day(&self, date: NaiveDate) -> bool;

    /// Whether `now` falls inside regular trading hours.
    fn is_trading_time(&self, now: NaiveTime) -> bool {
        in_trading_session(now)
    }

    /// Whether `now` falls inside the 14:30-15:00 watch window.
    fn is_watch_period(&self, now: NaiveTime) -> bool {
        in_watch_window(now)
    }
}
