// =============================================================================
// MinuteDataHandler — subscription, cooperative polling, dedup, cache
// =============================================================================
//
// Owns the subscription to a set of symbols and a background polling worker
// that asks the provider for the latest minute bars on a fixed cadence
// during trading hours. Incoming bars are deduplicated per symbol on their
// timestamp, merged into an in-memory cache, and fanned out to registered
// callbacks exactly once per newly observed bar, in timestamp order.
//
// Thread-safety: all mutable state sits behind parking_lot::RwLock;
// callbacks are invoked outside every lock.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::market_data::{merge_bars, BarStore, MinuteBar};
use crate::provider::{MarketDataProvider, QuoteTick};
use crate::types::normalize_symbol;

/// Bars requested from the provider on each poll tick.
const POLL_FETCH_COUNT: usize = 10;
/// Bars requested per day when assembling a historical range.
const HISTORY_FETCH_COUNT: usize = 240;
/// Snapshot retention.
const SNAPSHOT_MAX_AGE_DAYS: i64 = 30;
/// Bound on the polling-worker join at shutdown.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type BarCallback = Arc<dyn Fn(&MinuteBar) + Send + Sync>;

struct Inner {
    symbols: Vec<String>,
    cache: HashMap<String, Vec<MinuteBar>>,
    last_seen: HashMap<String, NaiveDateTime>,
}

pub struct MinuteDataHandler {
    provider: Arc<dyn MarketDataProvider>,
    store: BarStore,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    callbacks: RwLock<Vec<BarCallback>>,
    running: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl MinuteDataHandler {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        store: BarStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            inner: RwLock::new(Inner {
                symbols: Vec::new(),
                cache: HashMap::new(),
                last_seen: HashMap::new(),
            }),
            callbacks: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            poll_task: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------

    /// Replace the subscription set. New symbols get an empty cache,
    /// warm-loaded from today's snapshot when one exists; the warm load also
    /// primes `last_seen` so a mid-day restart does not re-fire callbacks
    /// for bars already on disk.
    pub fn subscribe(&self, symbols: &[String]) {
        let mut normalized: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
        normalized.sort();
        normalized.dedup();

        let today = self.clock.today();
        let mut inner = self.inner.write();

        for symbol in &normalized {
            if inner.cache.contains_key(symbol) {
                continue;
            }
            inner.cache.insert(symbol.clone(), Vec::new());

            match self.store.load_day(symbol, today) {
                Ok(Some(bars)) if !bars.is_empty() => {
                    let last = bars.last().map(|b| b.timestamp);
                    info!(symbol = %symbol, bars = bars.len(), "cache warmed from snapshot");
                    inner.cache.insert(symbol.clone(), bars);
                    if let Some(last) = last {
                        inner.last_seen.insert(symbol.clone(), last);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "snapshot warm-load failed"),
            }
        }

        inner.symbols = normalized;
        info!(symbols = ?inner.symbols, "subscription updated");
    }

    /// Remove named symbols from the subscription, or everything when `None`.
    pub fn unsubscribe(&self, symbols: Option<&[String]>) {
        let mut inner = self.inner.write();
        match symbols {
            None => {
                inner.symbols.clear();
                inner.cache.clear();
                inner.last_seen.clear();
            }
            Some(symbols) => {
                for symbol in symbols {
                    let symbol = normalize_symbol(symbol);
                    inner.symbols.retain(|s| s != &symbol);
                    inner.cache.remove(&symbol);
                    inner.last_seen.remove(&symbol);
                }
            }
        }
    }

    /// Register a callback fired once per newly observed bar.
    pub fn on_bar(&self, callback: impl Fn(&MinuteBar) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn clear_bar_callbacks(&self) {
        self.callbacks.write().clear();
    }

    // -------------------------------------------------------------------------
    // Polling lifecycle
    // -------------------------------------------------------------------------

    /// Start the background polling worker. No-op when already running.
    pub fn start_polling(self: &Arc<Self>, interval_secs: u64) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("polling already running");
            return;
        }

        let handler = self.clone();
        let handle = tokio::spawn(async move {
            info!(interval_secs, "minute data polling started");
            while handler.running.load(Ordering::SeqCst) {
                let now = handler.clock.now().time();
                if handler.provider.is_trading_time(now) {
                    handler.poll_once().await;
                } else {
                    debug!("outside trading hours, skipping poll");
                }

                // Interruptible sleep so stop() is honoured within ~1s.
                for _ in 0..interval_secs {
                    if !handler.running.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        *self.poll_task.lock() = Some(handle);
    }

    /// Signal the worker to stop and wait (bounded) for it to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.poll_task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("polling worker did not stop within the join timeout");
            }
        }
        info!("minute data polling stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One polling pass over every subscribed symbol: fetch the latest bars,
    /// drop anything at or before the per-symbol high-water mark, merge the
    /// rest into the cache, and fire callbacks in timestamp order.
    pub(crate) async fn poll_once(&self) {
        let symbols = self.inner.read().symbols.clone();

        for symbol in symbols {
            let mut bars = self
                .provider
                .get_minute_bars(&symbol, 1, POLL_FETCH_COUNT, None)
                .await;
            if bars.is_empty() {
                continue;
            }
            // Adapters may return the resolved month code; everything
            // downstream is keyed on the subscribed symbol.
            for bar in &mut bars {
                bar.symbol = symbol.clone();
            }

            let new_bars = {
                let mut inner = self.inner.write();
                let last_seen = inner.last_seen.get(&symbol).copied();

                let mut new_bars: Vec<MinuteBar> = bars
                    .iter()
                    .filter(|b| last_seen.map_or(true, |seen| b.timestamp > seen))
                    .cloned()
                    .collect();
                new_bars.sort_by_key(|b| b.timestamp);

                if let Some(max) = new_bars.last().map(|b| b.timestamp) {
                    inner.last_seen.insert(symbol.clone(), max);
                    merge_bars(inner.cache.entry(symbol.clone()).or_default(), &bars);
                }
                new_bars
            };

            if new_bars.is_empty() {
                continue;
            }
            debug!(symbol = %symbol, new = new_bars.len(), "new bars observed");

            let callbacks = self.callbacks.read().clone();
            for bar in &new_bars {
                for callback in &callbacks {
                    // One misbehaving callback must not starve the others
                    // or the remaining bars.
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| callback.as_ref()(bar)));
                    if result.is_err() {
                        error!(symbol = %bar.symbol, timestamp = %bar.timestamp, "bar callback panicked");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cache queries
    // -------------------------------------------------------------------------

    /// Copy of the cached bars for `symbol`, optionally bounded by time.
    pub fn get_cached_bars(
        &self,
        symbol: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> Vec<MinuteBar> {
        let symbol = normalize_symbol(symbol);
        let inner = self.inner.read();
        let Some(bars) = inner.cache.get(&symbol) else {
            return Vec::new();
        };
        bars.iter()
            .filter(|b| start.map_or(true, |s| b.timestamp >= s))
            .filter(|b| end.map_or(true, |e| b.timestamp <= e))
            .cloned()
            .collect()
    }

    /// Close of the most recent cached bar.
    pub fn get_latest_price(&self, symbol: &str) -> Option<f64> {
        let symbol = normalize_symbol(symbol);
        let inner = self.inner.read();
        inner.cache.get(&symbol)?.last().map(|b| b.close)
    }

    /// Close of the last bar today at or before `target` (e.g. the 14:30
    /// base-price anchor).
    pub fn get_price_at_time(&self, symbol: &str, target: NaiveTime) -> Option<f64> {
        let symbol = normalize_symbol(symbol);
        let today = self.clock.today();
        let inner = self.inner.read();
        inner
            .cache
            .get(&symbol)?
            .iter()
            .filter(|b| b.date() == today && b.time() <= target)
            .next_back()
            .map(|b| b.close)
    }

    /// Real-time quote passthrough to the provider.
    pub async fn get_realtime_quote(&self, symbol: &str) -> Option<QuoteTick> {
        self.provider.get_realtime_quote(symbol).await
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Persist today's cache for every subscribed symbol, then prune
    /// snapshots past the retention window. Called at end of day.
    pub fn save_all_and_cleanup(&self) {
        let today = self.clock.today();
        let (symbols, caches) = {
            let inner = self.inner.read();
            let caches: Vec<(String, Vec<MinuteBar>)> = inner
                .symbols
                .iter()
                .filter_map(|s| inner.cache.get(s).map(|bars| (s.clone(), bars.clone())))
                .collect();
            (inner.symbols.clone(), caches)
        };

        for (symbol, bars) in caches {
            if let Err(e) = self.store.save_day(&symbol, today, &bars) {
                warn!(symbol = %symbol, error = %e, "snapshot save failed");
            }
        }

        let cutoff = today - chrono::Duration::days(SNAPSHOT_MAX_AGE_DAYS);
        self.store.cleanup_before(cutoff);
        debug!(symbols = ?symbols, "end-of-day persistence done");
    }

    /// Assemble minute bars for a date range: local snapshots first, the
    /// provider for missing days (persisting what it returns), merged and
    /// deduplicated in ascending order.
    pub async fn fetch_historical_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        period: u32,
    ) -> Vec<MinuteBar> {
        let symbol = normalize_symbol(symbol);
        let mut combined: Vec<MinuteBar> = Vec::new();

        let mut day = start;
        while day <= end {
            let local = match self.store.load_day(&symbol, day) {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(symbol = %symbol, date = %day, error = %e, "snapshot load failed");
                    None
                }
            };

            let bars = match local {
                Some(bars) => bars,
                None => {
                    let mut fetched = self
                        .provider
                        .get_minute_bars(&symbol, period, HISTORY_FETCH_COUNT, Some(day))
                        .await;
                    fetched.retain(|b| b.date() == day);
                    for bar in &mut fetched {
                        bar.symbol = symbol.clone();
                    }
                    if !fetched.is_empty() {
                        if let Err(e) = self.store.save_day(&symbol, day, &fetched) {
                            warn!(symbol = %symbol, date = %day, error = %e, "snapshot save failed");
                        }
                    }
                    fetched
                }
            };

            merge_bars(&mut combined, &bars);
            day += chrono::Duration::days(1);
        }

        combined
    }
}
