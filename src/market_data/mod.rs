// =============================================================================
// Market Data Module
// =============================================================================
//
// Minute-bar ingestion for the settlement-arbitrage engine:
// - MinuteBar value type (validated at the ingress boundary)
// - MinuteDataHandler: subscription, cooperative polling, dedup, cache,
//   bar callbacks
// - BarStore: one CSV snapshot per (product, date), 30-day retention

pub mod handler;
pub mod store;

pub use handler::MinuteDataHandler;
pub use store::BarStore;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// A single minute K-line bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    /// Contract code (e.g. "IM2503" or main-contract shorthand "IM0").
    pub symbol: String,
    /// Bar timestamp in exchange-local time.
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in lots.
    pub volume: f64,
    /// Turnover in yuan. Zero when the source does not report it.
    pub amount: f64,
}

impl MinuteBar {
    /// Price/volume sanity check applied at the ingress boundary.
    /// Invalid rows from a data source are dropped, not repaired.
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
            && self.volume >= 0.0
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn time(&self) -> NaiveTime {
        self.timestamp.time()
    }
}

/// Merge `incoming` into `cache`, deduplicating on timestamp (last write
/// wins) and keeping ascending order. Shared by the handler cache and the
/// historical range assembly.
pub fn merge_bars(cache: &mut Vec<MinuteBar>, incoming: &[MinuteBar]) {
    for bar in incoming {
        match cache.binary_search_by_key(&bar.timestamp, |b| b.timestamp) {
            Ok(idx) => cache[idx] = bar.clone(),
            Err(idx) => cache.insert(idx, bar.clone()),
        }
    }
}
