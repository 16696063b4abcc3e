// =============================================================================
// Sina adapter — best-effort market data for CFFEX index futures
// =============================================================================
//
// Uses the public Sina finance endpoints:
//   - InnerFuturesNewService.getFewMinLine   minute klines (JSONP)
//   - InnerFuturesNewService.getDailyKLine   daily klines incl. settlement
//   - hq.sinajs.cn/list=nf_<code>            real-time quote
//
// Main-contract shorthand ("IM0") is resolved locally from the calendar:
// CFFEX contracts expire on the third Friday of their month, so the main
// contract is the current month until expiry, then the next month. The
// resolution is cached for an hour.
//
// Every fetch failure logs at WARN and returns empty/None — the engine
// treats a vendor outage as "no new data" and keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::market_data::MinuteBar;
use crate::provider::{KlineRow, MarketDataProvider, QuoteTick, Timeframe};
use crate::types::{is_main_contract, normalize_symbol, product_of};

const MINUTE_KLINE_URL: &str =
    "https://stock2.finance.sina.com.cn/futures/api/jsonp.php/=/InnerFuturesNewService.getFewMinLine";
const DAILY_KLINE_URL: &str =
    "https://stock2.finance.sina.com.cn/futures/api/jsonp.php/=/InnerFuturesNewService.getDailyKLine";
const QUOTE_URL: &str = "https://hq.sinajs.cn/list=nf_";

/// Main-contract resolution cache TTL.
const MAIN_CACHE_TTL: Duration = Duration::from_secs(3600);

pub struct SinaProvider {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    /// product -> (contract code, resolved at)
    main_cache: RwLock<HashMap<String, (String, Instant)>>,
}

impl SinaProvider {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for SinaProvider"),
            clock,
            main_cache: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol resolution
    // -------------------------------------------------------------------------

    /// Resolve a symbol to a concrete contract code. Main-contract shorthand
    /// ("IM0") maps to the derived current main contract ("IM2608").
    pub fn resolve_symbol(&self, symbol: &str) -> String {
        let symbol = normalize_symbol(symbol);
        if !is_main_contract(&symbol) {
            return symbol;
        }

        let product = product_of(&symbol);

        if let Some((code, at)) = self.main_cache.read().get(&product) {
            if at.elapsed() < MAIN_CACHE_TTL {
                return code.clone();
            }
        }

        let code = derive_main_contract(&product, self.clock.today());
        self.main_cache
            .write()
            .insert(product, (code.clone(), Instant::now()));
        code
    }

    // -------------------------------------------------------------------------
    // HTTP + JSONP plumbing
    // -------------------------------------------------------------------------

    async fn fetch_jsonp(&self, url: &str) -> Result<serde_json::Value> {
        let text = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .text()
            .await
            .context("failed to read response body")?;

        // Payload arrives wrapped as `=( ... );` — strip to the JSON inside.
        let start = text.find('(').map(|i| i + 1).unwrap_or(0);
        let end = text.rfind(')').unwrap_or(text.len());
        let json = text.get(start..end).unwrap_or("").trim();

        serde_json::from_str(json).with_context(|| format!("failed to parse JSONP from {url}"))
    }

    fn parse_kline_rows(value: &serde_json::Value) -> Vec<(NaiveDateTime, [f64; 5], Option<f64>)> {
        let Some(rows) = value.as_array() else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(d) = row.get("d").and_then(|v| v.as_str()) else {
                continue;
            };
            // Daily rows carry a date only; minute rows a full timestamp.
            let ts = NaiveDateTime::parse_from_str(d, "%Y-%m-%d %H:%M:%S")
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(d, "%Y-%m-%d")
                        .ok()
                        .and_then(|date| date.and_hms_opt(15, 0, 0))
                });
            let Some(ts) = ts else { continue };

            let ohlcv = [
                json_f64(row, "o"),
                json_f64(row, "h"),
                json_f64(row, "l"),
                json_f64(row, "c"),
                json_f64(row, "v"),
            ];
            // Daily rows include the exchange settlement price as "s".
            let settlement = row.get("s").and_then(value_as_f64).filter(|s| *s > 0.0);

            out.push((ts, ohlcv, settlement));
        }
        out.sort_by_key(|(ts, _, _)| *ts);
        out
    }

    async fn fetch_minute_rows(&self, code: &str, period: u32) -> Result<Vec<MinuteBar>> {
        let url = format!("{MINUTE_KLINE_URL}?symbol={code}&type={period}");
        let value = self.fetch_jsonp(&url).await?;

        let bars = Self::parse_kline_rows(&value)
            .into_iter()
            .map(|(ts, [o, h, l, c, v], _)| MinuteBar {
                symbol: code.to_string(),
                timestamp: ts,
                open: o,
                high: h,
                low: l,
                close: c,
                volume: v,
                amount: 0.0,
            })
            .filter(MinuteBar::is_valid)
            .collect();

        Ok(bars)
    }

    async fn fetch_daily_rows(&self, code: &str) -> Result<Vec<(NaiveDateTime, [f64; 5], Option<f64>)>> {
        let url = format!("{DAILY_KLINE_URL}?symbol={code}");
        let value = self.fetch_jsonp(&url).await?;
        Ok(Self::parse_kline_rows(&value))
    }
}

impl Default for SinaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for SinaProvider {
    async fn get_minute_bars(
        &self,
        symbol: &str,
        period: u32,
        count: usize,
        start_date: Option<NaiveDate>,
    ) -> Vec<MinuteBar> {
        let code = self.resolve_symbol(symbol);
        let period = if matches!(period, 1 | 5 | 15 | 30 | 60) {
            period
        } else {
            warn!(symbol, period, "unsupported minute period, using 1");
            1
        };

        let mut bars = match self.fetch_minute_rows(&code, period).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol = %code, error = %e, "minute bar fetch failed");
                return Vec::new();
            }
        };

        if let Some(start) = start_date {
            bars.retain(|b| b.date() >= start);
        }
        if bars.len() > count {
            bars.drain(..bars.len() - count);
        }

        debug!(symbol = %code, period, got = bars.len(), "minute bars fetched");
        bars
    }

    async fn get_realtime_quote(&self, symbol: &str) -> Option<QuoteTick> {
        let code = self.resolve_symbol(symbol);
        let url = format!("{QUOTE_URL}{code}");

        let text = match self
            .client
            .get(&url)
            .header("Referer", "https://finance.sina.com.cn")
            .send()
            .await
        {
            Ok(resp) => match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(symbol = %code, error = %e, "quote body read failed");
                    return None;
                }
            },
            Err(e) => {
                warn!(symbol = %code, error = %e, "quote fetch failed");
                return None;
            }
        };

        // Payload: var hq_str_nf_IM2608="<comma-separated fields>";
        // nf_ field layout (positions used here):
        //   0 open, 1 high, 2 low, 3 last, 4 volume, 5 amount,
        //   6 bid, 7 ask, 13 pre-settlement, 14 pre-close
        let inner = text.split('"').nth(1)?;
        let parts: Vec<&str> = inner.split(',').collect();
        if parts.len() < 5 {
            warn!(symbol = %code, fields = parts.len(), "quote payload too short");
            return None;
        }

        let f = |idx: usize| -> f64 {
            parts
                .get(idx)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        let last = f(3);
        if last <= 0.0 {
            return None;
        }

        Some(QuoteTick {
            symbol: code,
            last,
            open: f(0),
            high: f(1),
            low: f(2),
            pre_close: Some(f(14)).filter(|v| *v > 0.0),
            bid: if f(6) > 0.0 { f(6) } else { last },
            ask: if f(7) > 0.0 { f(7) } else { last },
            volume: f(4),
            amount: f(5),
            timestamp: self.clock.now().timestamp(),
        })
    }

    async fn get_settlement_price(&self, symbol: &str, date: Option<NaiveDate>) -> Option<f64> {
        let code = self.resolve_symbol(symbol);
        let rows = match self.fetch_daily_rows(&code).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(symbol = %code, error = %e, "daily kline fetch failed");
                return None;
            }
        };

        let row = match date {
            Some(d) => rows.iter().find(|(ts, _, _)| ts.date() == d),
            None => rows.last(),
        }?;

        // Prefer the published settlement; a zero/missing value means the
        // caller falls back to its own VWAP estimate.
        row.2
    }

    async fn get_kline(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        before: Option<NaiveDateTime>,
    ) -> Vec<KlineRow> {
        let code = self.resolve_symbol(symbol);
        let limit = limit.min(1000);

        let rows = match timeframe.minutes() {
            Some(period) => match self.fetch_minute_rows(&code, period).await {
                Ok(bars) => bars
                    .into_iter()
                    .map(|b| KlineRow {
                        time: b.timestamp,
                        open: b.open,
                        high: b.high,
                        low: b.low,
                        close: b.close,
                        volume: b.volume,
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(symbol = %code, error = %e, "kline fetch failed");
                    return Vec::new();
                }
            },
            None => match self.fetch_daily_rows(&code).await {
                Ok(rows) => rows
                    .into_iter()
                    .map(|(ts, [o, h, l, c, v], _)| KlineRow {
                        time: ts,
                        open: o,
                        high: h,
                        low: l,
                        close: c,
                        volume: v,
                    })
                    .collect::<Vec<_>>(),
                Err(e) => {
                    warn!(symbol = %code, error = %e, "daily kline fetch failed");
                    return Vec::new();
                }
            },
        };

        let mut rows = rows;
        if let Some(before) = before {
            rows.retain(|r| r.time < before);
        }
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        rows
    }

    async fn is_trading_day(&self, date: NaiveDate) -> bool {
        // Weekend filter only. CFFEX holiday closures surface as empty
        // fetches, which the polling layer already tolerates.
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn value_as_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(row: &serde_json::Value, key: &str) -> f64 {
    row.get(key).and_then(value_as_f64).unwrap_or(0.0)
}

/// Third Friday of a month — CFFEX expiry day.
fn third_friday(year: i32, month: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (Weekday::Fri.num_days_from_monday() + 7
        - first.weekday().num_days_from_monday())
        % 7;
    first + chrono::Duration::days(offset as i64 + 14)
}

/// Derive the main contract code for `product` as of `today`: the current
/// month until its third-Friday expiry, then the next month.
fn derive_main_contract(product: &str, today: NaiveDate) -> String {
    let (mut year, mut month) = (today.year(), today.month());
    if today > third_friday(year, month) {
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    format!("{product}{:02}{:02}", year % 100, month)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_friday_examples() {
        // February 2026: Fridays are 6, 13, 20, 27.
        assert_eq!(
            third_friday(2026, 2),
            NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()
        );
        // May 2026 starts on a Friday: 1, 8, 15.
        assert_eq!(
            third_friday(2026, 5),
            NaiveDate::from_ymd_opt(2026, 5, 15).unwrap()
        );
    }

    #[test]
    fn main_contract_rolls_after_expiry() {
        let before = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();
        assert_eq!(derive_main_contract("IM", before), "IM2602");

        let after = NaiveDate::from_ymd_opt(2026, 2, 23).unwrap();
        assert_eq!(derive_main_contract("IM", after), "IM2603");

        let december = NaiveDate::from_ymd_opt(2026, 12, 28).unwrap();
        assert_eq!(derive_main_contract("IC", december), "IC2701");
    }

    #[test]
    fn kline_rows_parse_strings_and_numbers() {
        let value: serde_json::Value = serde_json::from_str(
            r#"[
                {"d": "2026-02-09 14:31:00", "o": "5898.0", "h": "5901.2", "l": "5896.0", "c": 5900.0, "v": "321"},
                {"d": "2026-02-09 14:30:00", "o": "5900.0", "h": "5902.0", "l": "5899.0", "c": "5900.8", "v": 280}
            ]"#,
        )
        .unwrap();

        let rows = SinaProvider::parse_kline_rows(&value);
        assert_eq!(rows.len(), 2);
        // Sorted ascending regardless of input order.
        assert!(rows[0].0 < rows[1].0);
        assert_eq!(rows[0].1[3], 5900.8);
        assert_eq!(rows[1].1[4], 321.0);
    }

    #[test]
    fn daily_rows_carry_settlement() {
        let value: serde_json::Value = serde_json::from_str(
            r#"[{"d": "2026-02-09", "o": "5900", "h": "5950", "l": "5850", "c": "5880", "v": "12345", "s": "5890.4"}]"#,
        )
        .unwrap();

        let rows = SinaProvider::parse_kline_rows(&value);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, Some(5890.4));
    }
}
