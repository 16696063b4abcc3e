// =============================================================================
// VWAP Calculator — settlement-style volume-weighted average price
// =============================================================================
//
// The CFFEX settlement price for index futures is the VWAP of the last
// trading hour (14:00-15:00). This module provides the batch calculation
// over cached bars, an incremental per-symbol accumulator for live use,
// and a settlement-price lookup that prefers the official number and
// falls back to its own estimate.
//
// All returned prices are rounded to 2 decimals; deviation percentages
// to 6.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::market_data::MinuteBar;
use crate::provider::MarketDataProvider;

/// Default settlement window start (14:00).
pub fn default_vwap_start() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 0, 0).unwrap()
}

/// Default settlement window end (15:00).
pub fn default_vwap_end() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap()
}

/// Which bar price feeds the weighted average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
}

impl PriceField {
    fn of(&self, bar: &MinuteBar) -> f64 {
        match self {
            Self::Open => bar.open,
            Self::High => bar.high,
            Self::Low => bar.low,
            Self::Close => bar.close,
        }
    }
}

/// Snapshot of the incremental accumulator for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeVwapStats {
    pub symbol: String,
    pub vwap: Option<f64>,
    pub total_volume: f64,
    pub total_pv: f64,
    pub bar_count: u64,
}

/// Deviation of a price from the settlement reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SettlementDeviation {
    pub deviation: f64,
    pub deviation_pct: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RtState {
    pv: f64,
    volume: f64,
    bars: u64,
}

impl RtState {
    fn vwap(&self) -> Option<f64> {
        if self.bars == 0 {
            return None;
        }
        if self.volume > 0.0 {
            Some(round2(self.pv / self.volume))
        } else {
            // No volume reported — degrade to the simple price average.
            Some(round2(self.pv / self.bars as f64))
        }
    }
}

pub struct VWAPCalculator {
    provider: Arc<dyn MarketDataProvider>,
    /// (symbol, date-or-"latest") -> settlement price
    settlement_cache: RwLock<HashMap<(String, String), f64>>,
    realtime: RwLock<HashMap<String, RtState>>,
}

impl VWAPCalculator {
    pub fn new(provider: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            provider,
            settlement_cache: RwLock::new(HashMap::new()),
            realtime: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Batch calculation (pure)
    // -------------------------------------------------------------------------

    /// VWAP of `bars` whose time-of-day falls in `[start, end]`, weighted on
    /// close. `None` when no bars land in the window; with zero total volume
    /// the simple mean of the price is returned instead.
    pub fn calculate_vwap(bars: &[MinuteBar], start: NaiveTime, end: NaiveTime) -> Option<f64> {
        Self::calculate_vwap_field(bars, start, end, PriceField::Close)
    }

    pub fn calculate_vwap_field(
        bars: &[MinuteBar],
        start: NaiveTime,
        end: NaiveTime,
        field: PriceField,
    ) -> Option<f64> {
        Self::weighted_average(bars, start, end, |b| field.of(b))
    }

    /// VWAP on the typical price `(H + L + C) / 3`.
    pub fn calculate_vwap_typical(
        bars: &[MinuteBar],
        start: NaiveTime,
        end: NaiveTime,
    ) -> Option<f64> {
        Self::weighted_average(bars, start, end, |b| (b.high + b.low + b.close) / 3.0)
    }

    fn weighted_average(
        bars: &[MinuteBar],
        start: NaiveTime,
        end: NaiveTime,
        price: impl Fn(&MinuteBar) -> f64,
    ) -> Option<f64> {
        let window: Vec<&MinuteBar> = bars
            .iter()
            .filter(|b| {
                let t = b.time();
                start <= t && t <= end
            })
            .collect();

        if window.is_empty() {
            warn!(%start, %end, bars = bars.len(), "no bars in VWAP window");
            return None;
        }

        let total_volume: f64 = window.iter().map(|b| b.volume).sum();
        if total_volume == 0.0 {
            warn!("zero total volume in VWAP window, using simple average");
            let mean = window.iter().map(|b| price(b)).sum::<f64>() / window.len() as f64;
            return Some(round2(mean));
        }

        let pv: f64 = window.iter().map(|b| price(b) * b.volume).sum();
        Some(round2(pv / total_volume))
    }

    // -------------------------------------------------------------------------
    // Incremental real-time VWAP
    // -------------------------------------------------------------------------

    /// Reset the accumulator for one symbol, or all of them. Called at the
    /// start of each settlement window.
    pub fn reset_realtime(&self, symbol: Option<&str>) {
        let mut rt = self.realtime.write();
        match symbol {
            Some(symbol) => {
                rt.remove(symbol);
            }
            None => rt.clear(),
        }
    }

    /// Feed one bar into the accumulator and return the running VWAP.
    pub fn update_realtime(&self, symbol: &str, price: f64, volume: f64) -> f64 {
        let mut rt = self.realtime.write();
        let state = rt.entry(symbol.to_string()).or_default();
        state.pv += price * volume;
        state.volume += volume;
        state.bars += 1;
        state.vwap().unwrap_or(0.0)
    }

    pub fn get_realtime_vwap(&self, symbol: &str) -> Option<f64> {
        self.realtime.read().get(symbol).and_then(RtState::vwap)
    }

    pub fn get_realtime_stats(&self, symbol: &str) -> RealtimeVwapStats {
        let rt = self.realtime.read();
        let state = rt.get(symbol).copied().unwrap_or_default();
        RealtimeVwapStats {
            symbol: symbol.to_string(),
            vwap: state.vwap(),
            total_volume: state.volume,
            total_pv: state.pv,
            bar_count: state.bars,
        }
    }

    // -------------------------------------------------------------------------
    // Settlement price lookup
    // -------------------------------------------------------------------------

    /// Settlement price for `(symbol, date)`: the official exchange number
    /// when available and positive, otherwise a VWAP computed from that
    /// day's minute bars. Results are memoized.
    pub async fn get_settlement_price(
        &self,
        symbol: &str,
        date: Option<NaiveDate>,
        use_cache: bool,
    ) -> Option<f64> {
        let date_key = date.map_or_else(|| "latest".to_string(), |d| d.to_string());
        let cache_key = (symbol.to_string(), date_key);

        if use_cache {
            if let Some(cached) = self.settlement_cache.read().get(&cache_key) {
                return Some(*cached);
            }
        }

        if let Some(official) = self.provider.get_settlement_price(symbol, date).await {
            if official > 0.0 {
                self.settlement_cache.write().insert(cache_key, official);
                return Some(official);
            }
        }

        debug!(symbol, "official settlement unavailable, computing VWAP");
        let bars = self.provider.get_minute_bars(symbol, 1, 240, date).await;
        let vwap = Self::calculate_vwap(&bars, default_vwap_start(), default_vwap_end())?;
        self.settlement_cache.write().insert(cache_key, vwap);
        Some(vwap)
    }

    /// Drop both the settlement memo and the real-time accumulators.
    pub fn clear_cache(&self) {
        self.settlement_cache.write().clear();
        self.reset_realtime(None);
    }

    // -------------------------------------------------------------------------
    // Utilities
    // -------------------------------------------------------------------------

    /// Deviation of `current` from `settlement`. Zero-safe: a zero
    /// settlement yields a zero deviation.
    pub fn calculate_price_vs_settlement(current: f64, settlement: f64) -> SettlementDeviation {
        if settlement == 0.0 {
            return SettlementDeviation {
                deviation: 0.0,
                deviation_pct: 0.0,
            };
        }
        let deviation = current - settlement;
        SettlementDeviation {
            deviation: round2(deviation),
            deviation_pct: round6(deviation / settlement),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{KlineRow, QuoteTick, Timeframe};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bar(ts: &str, close: f64, volume: f64) -> MinuteBar {
        MinuteBar {
            symbol: "IM0".into(),
            timestamp: NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap(),
            open: close,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume,
            amount: 0.0,
        }
    }

    fn window() -> (NaiveTime, NaiveTime) {
        (default_vwap_start(), default_vwap_end())
    }

    #[test]
    fn batch_vwap_weights_by_volume() {
        let (start, end) = window();
        let bars = vec![
            bar("2026-02-09 14:10:00", 5900.0, 100.0),
            bar("2026-02-09 14:20:00", 5920.0, 300.0),
        ];
        // (5900*100 + 5920*300) / 400 = 5915
        assert_eq!(VWAPCalculator::calculate_vwap(&bars, start, end), Some(5915.0));
    }

    #[test]
    fn batch_vwap_filters_to_window() {
        let (start, end) = window();
        let bars = vec![
            bar("2026-02-09 13:30:00", 5000.0, 1000.0), // outside window
            bar("2026-02-09 14:30:00", 5900.0, 100.0),
        ];
        assert_eq!(VWAPCalculator::calculate_vwap(&bars, start, end), Some(5900.0));
    }

    #[test]
    fn empty_input_and_empty_window_return_none() {
        let (start, end) = window();
        assert_eq!(VWAPCalculator::calculate_vwap(&[], start, end), None);

        let bars = vec![bar("2026-02-09 09:31:00", 5900.0, 10.0)];
        assert_eq!(VWAPCalculator::calculate_vwap(&bars, start, end), None);
    }

    #[test]
    fn zero_volume_falls_back_to_simple_mean() {
        let (start, end) = window();
        let bars = vec![
            bar("2026-02-09 14:10:00", 5900.0, 0.0),
            bar("2026-02-09 14:20:00", 5910.0, 0.0),
        ];
        assert_eq!(VWAPCalculator::calculate_vwap(&bars, start, end), Some(5905.0));
    }

    #[test]
    fn typical_price_vwap() {
        let (start, end) = window();
        // typical = (H + L + C) / 3 = ((c+2) + (c-2) + c) / 3 = c
        let bars = vec![bar("2026-02-09 14:10:00", 5901.0, 50.0)];
        assert_eq!(
            VWAPCalculator::calculate_vwap_typical(&bars, start, end),
            Some(5901.0)
        );
    }

    struct NoopProvider;

    #[async_trait]
    impl MarketDataProvider for NoopProvider {
        async fn get_minute_bars(
            &self,
            _s: &str,
            _p: u32,
            _c: usize,
            _d: Option<NaiveDate>,
        ) -> Vec<MinuteBar> {
            Vec::new()
        }
        async fn get_realtime_quote(&self, _s: &str) -> Option<QuoteTick> {
            None
        }
        async fn get_settlement_price(&self, _s: &str, _d: Option<NaiveDate>) -> Option<f64> {
            None
        }
        async fn get_kline(
            &self,
            _s: &str,
            _t: Timeframe,
            _l: usize,
            _b: Option<NaiveDateTime>,
        ) -> Vec<KlineRow> {
            Vec::new()
        }
        async fn is_trading_day(&self, _d: NaiveDate) -> bool {
            true
        }
    }

    #[test]
    fn realtime_accumulator_matches_batch() {
        let calc = VWAPCalculator::new(Arc::new(NoopProvider));
        let (start, end) = window();
        let bars = vec![
            bar("2026-02-09 14:05:00", 5900.0, 120.0),
            bar("2026-02-09 14:06:00", 5895.0, 80.0),
            bar("2026-02-09 14:07:00", 5902.5, 200.0),
        ];

        let mut last = 0.0;
        for b in &bars {
            last = calc.update_realtime("IM0", b.close, b.volume);
        }

        let batch = VWAPCalculator::calculate_vwap(&bars, start, end).unwrap();
        assert_eq!(last, batch);
        assert_eq!(calc.get_realtime_vwap("IM0"), Some(batch));

        let stats = calc.get_realtime_stats("IM0");
        assert_eq!(stats.bar_count, 3);
        assert_eq!(stats.total_volume, 400.0);
    }

    #[test]
    fn realtime_zero_volume_uses_bar_count() {
        let calc = VWAPCalculator::new(Arc::new(NoopProvider));
        calc.update_realtime("IC0", 5000.0, 0.0);
        let vwap = calc.update_realtime("IC0", 5010.0, 0.0);
        assert_eq!(vwap, 0.0); // pv stays zero without volume
        assert_eq!(calc.get_realtime_stats("IC0").bar_count, 2);
    }

    #[test]
    fn reset_realtime_scopes_to_symbol() {
        let calc = VWAPCalculator::new(Arc::new(NoopProvider));
        calc.update_realtime("IM0", 5900.0, 10.0);
        calc.update_realtime("IC0", 5000.0, 10.0);

        calc.reset_realtime(Some("IM0"));
        assert_eq!(calc.get_realtime_vwap("IM0"), None);
        assert!(calc.get_realtime_vwap("IC0").is_some());

        calc.reset_realtime(None);
        assert_eq!(calc.get_realtime_vwap("IC0"), None);
    }

    #[test]
    fn deviation_is_zero_safe() {
        let dev = VWAPCalculator::calculate_price_vs_settlement(5900.0, 0.0);
        assert_eq!(dev.deviation, 0.0);
        assert_eq!(dev.deviation_pct, 0.0);

        let dev = VWAPCalculator::calculate_price_vs_settlement(5850.0, 5900.0);
        assert_eq!(dev.deviation, -50.0);
        assert_eq!(dev.deviation_pct, -0.008475);
    }

    /// Official settlement missing -> computed from minute bars and memoized.
    struct FallbackProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MarketDataProvider for FallbackProvider {
        async fn get_minute_bars(
            &self,
            _s: &str,
            _p: u32,
            _c: usize,
            _d: Option<NaiveDate>,
        ) -> Vec<MinuteBar> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![
                bar("2026-02-09 14:10:00", 5900.0, 100.0),
                bar("2026-02-09 14:20:00", 5920.0, 300.0),
            ]
        }
        async fn get_realtime_quote(&self, _s: &str) -> Option<QuoteTick> {
            None
        }
        async fn get_settlement_price(&self, _s: &str, _d: Option<NaiveDate>) -> Option<f64> {
            Some(0.0) // zero value is treated as unavailable
        }
        async fn get_kline(
            &self,
            _s: &str,
            _t: Timeframe,
            _l: usize,
            _b: Option<NaiveDateTime>,
        ) -> Vec<KlineRow> {
            Vec::new()
        }
        async fn is_trading_day(&self, _d: NaiveDate) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn settlement_falls_back_to_vwap_and_memoizes() {
        let provider = Arc::new(FallbackProvider {
            calls: AtomicU32::new(0),
        });
        let calc = VWAPCalculator::new(provider.clone());
        let date = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();

        let first = calc.get_settlement_price("IM0", Some(date), true).await;
        assert_eq!(first, Some(5915.0));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Cached — no second minute-bar fetch.
        let second = calc.get_settlement_price("IM0", Some(date), true).await;
        assert_eq!(second, Some(5915.0));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        calc.clear_cache();
        let third = calc.get_settlement_price("IM0", Some(date), true).await;
        assert_eq!(third, Some(5915.0));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
