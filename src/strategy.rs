// =============================================================================
// Settlement Arbitrage Strategy — per-symbol signal state machine
// =============================================================================
//
// State machine per tracked symbol, driven by minute bars:
//
//   Idle        -> first bar at/after watch_start anchors the base price
//   Watching    -> drop <= -threshold_1  => BUY_L1 -> PositionL1
//   PositionL1  -> drop <= -threshold_2  => BUY_L2 -> PositionL2
//   PositionL1/L2 -> next day's open     => SELL_CLOSE -> Closing
//   Closing     -> daily reset           => Idle
//
// An early-warning ALERT fires once per day while Watching, when the drop
// reaches -alert_threshold but not yet -threshold_1. All threshold
// comparisons are non-strict. At most one of {BUY_L1, BUY_L2} fires per
// bar: the L2 check requires the PositionL1 state from before the bar.
//
// The base price anchors at the close of the first bar at or after
// watch_start and never moves until the daily reset. A day rollover with a
// position still open (a day-open close that could not run) preserves the
// position state and clears everything else.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::market_data::MinuteBar;
use crate::types::normalize_symbol;
use crate::vwap::{default_vwap_end, default_vwap_start, VWAPCalculator};

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    BuyL1,
    BuyL2,
    Alert,
    SellClose,
}

/// Immutable output of the strategy, consumed by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub symbol: String,
    pub price: f64,
    pub base_price: f64,
    pub drop_pct: f64,
    /// Realtime settlement-window VWAP at emission, when accumulated.
    pub vwap: Option<f64>,
    /// Entry level (1 or 2); for SELL_CLOSE the highest level entered.
    pub level: u8,
    /// Lots. For SELL_CLOSE the total quantity to flatten.
    pub quantity: u32,
    pub timestamp: NaiveDateTime,
}

// ---------------------------------------------------------------------------
// Per-symbol state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyState {
    Idle,
    Watching,
    PositionL1,
    PositionL2,
    Closing,
}

#[derive(Debug, Clone)]
struct SymbolState {
    state: StrategyState,
    base_price: Option<f64>,
    entry_prices: Vec<f64>,
    entry_quantities: Vec<u32>,
    entry_levels: Vec<u8>,
    alert_emitted_today: bool,
    signals_today: Vec<Signal>,
    last_date: Option<NaiveDate>,
}

impl Default for SymbolState {
    fn default() -> Self {
        Self {
            state: StrategyState::Idle,
            base_price: None,
            entry_prices: Vec::new(),
            entry_quantities: Vec::new(),
            entry_levels: Vec::new(),
            alert_emitted_today: false,
            signals_today: Vec::new(),
            last_date: None,
        }
    }
}

impl SymbolState {
    fn has_position(&self) -> bool {
        matches!(
            self.state,
            StrategyState::PositionL1 | StrategyState::PositionL2
        )
    }

    fn total_quantity(&self) -> u32 {
        self.entry_quantities.iter().sum()
    }

    fn avg_entry_price(&self) -> Option<f64> {
        let qty = self.total_quantity();
        if qty == 0 {
            return None;
        }
        let notional: f64 = self
            .entry_prices
            .iter()
            .zip(&self.entry_quantities)
            .map(|(p, q)| p * *q as f64)
            .sum();
        Some(notional / qty as f64)
    }

    /// New-day reset. An open position (missed day-open close) survives with
    /// its entries; everything day-scoped is cleared.
    fn reset_daily(&mut self) {
        self.base_price = None;
        self.alert_emitted_today = false;
        self.signals_today.clear();
        if !self.has_position() {
            self.state = StrategyState::Idle;
            self.entry_prices.clear();
            self.entry_quantities.clear();
            self.entry_levels.clear();
        }
    }
}

/// Snapshot of one symbol's state for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolMonitor {
    pub symbol: String,
    pub state: StrategyState,
    pub base_price: Option<f64>,
    pub avg_entry_price: Option<f64>,
    pub total_quantity: u32,
    pub signals_today: usize,
    pub alert_emitted: bool,
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct SettlementArbitrageStrategy {
    config: RwLock<StrategyConfig>,
    vwap: Arc<VWAPCalculator>,
    states: RwLock<HashMap<String, SymbolState>>,
}

impl SettlementArbitrageStrategy {
    pub fn new(config: StrategyConfig, vwap: Arc<VWAPCalculator>) -> Self {
        Self {
            config: RwLock::new(config),
            vwap,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, config: StrategyConfig) {
        *self.config.write() = config;
    }

    /// Process one minute bar; returns the signals it produced (possibly
    /// none). Bars for untracked symbols are silently ignored.
    pub fn on_bar(&self, bar: &MinuteBar) -> Vec<Signal> {
        let config = self.config.read().clone();
        let symbol = normalize_symbol(&bar.symbol);
        if !config.normalized_symbols().contains(&symbol) {
            return Vec::new();
        }

        // Feed the settlement-window VWAP accumulator regardless of the
        // signal outcome — signals stamp the running VWAP at emission.
        let bar_time = bar.time();
        if default_vwap_start() <= bar_time && bar_time <= default_vwap_end() {
            self.vwap.update_realtime(&symbol, bar.close, bar.volume);
        }

        let mut states = self.states.write();
        let st = states.entry(symbol.clone()).or_default();

        // Day rollover.
        let bar_date = bar.date();
        if st.last_date != Some(bar_date) {
            if st.last_date.is_some() {
                debug!(symbol = %symbol, date = %bar_date, "day rollover, resetting daily state");
            }
            st.reset_daily();
            st.last_date = Some(bar_date);
        }

        if bar_time < config.watch_start {
            return Vec::new();
        }

        // First bar in the window anchors the base price; no signal.
        let Some(base_price) = st.base_price else {
            st.base_price = Some(bar.close);
            if st.state == StrategyState::Idle {
                st.state = StrategyState::Watching;
            }
            info!(symbol = %symbol, base_price = bar.close, "base price anchored");
            return Vec::new();
        };

        // Entries only inside the watch window.
        if bar_time > config.watch_end {
            return Vec::new();
        }

        let drop_pct = (bar.close - base_price) / base_price;
        let rt_vwap = self.vwap.get_realtime_vwap(&symbol);

        let mut signals = Vec::new();
        match st.state {
            StrategyState::Watching => {
                if drop_pct <= -config.threshold_1 {
                    let signal = Signal {
                        signal_type: SignalType::BuyL1,
                        symbol: symbol.clone(),
                        price: bar.close,
                        base_price,
                        drop_pct,
                        vwap: rt_vwap,
                        level: 1,
                        quantity: config.position_size_1,
                        timestamp: bar.timestamp,
                    };
                    st.entry_prices.push(bar.close);
                    st.entry_quantities.push(config.position_size_1);
                    st.entry_levels.push(1);
                    st.state = StrategyState::PositionL1;
                    info!(
                        symbol = %symbol,
                        price = bar.close,
                        drop_pct = format!("{:.4}", drop_pct),
                        "BUY_L1 signal"
                    );
                    signals.push(signal);
                } else if drop_pct <= -config.alert_threshold && !st.alert_emitted_today {
                    let signal = Signal {
                        signal_type: SignalType::Alert,
                        symbol: symbol.clone(),
                        price: bar.close,
                        base_price,
                        drop_pct,
                        vwap: rt_vwap,
                        level: 1,
                        quantity: 1,
                        timestamp: bar.timestamp,
                    };
                    st.alert_emitted_today = true;
                    info!(
                        symbol = %symbol,
                        price = bar.close,
                        drop_pct = format!("{:.4}", drop_pct),
                        "price alert"
                    );
                    signals.push(signal);
                }
            }
            StrategyState::PositionL1 => {
                if drop_pct <= -config.threshold_2 {
                    let signal = Signal {
                        signal_type: SignalType::BuyL2,
                        symbol: symbol.clone(),
                        price: bar.close,
                        base_price,
                        drop_pct,
                        vwap: rt_vwap,
                        level: 2,
                        quantity: config.position_size_2,
                        timestamp: bar.timestamp,
                    };
                    st.entry_prices.push(bar.close);
                    st.entry_quantities.push(config.position_size_2);
                    st.entry_levels.push(2);
                    st.state = StrategyState::PositionL2;
                    info!(
                        symbol = %symbol,
                        price = bar.close,
                        drop_pct = format!("{:.4}", drop_pct),
                        "BUY_L2 signal"
                    );
                    signals.push(signal);
                }
            }
            StrategyState::Idle | StrategyState::PositionL2 | StrategyState::Closing => {}
        }

        st.signals_today.extend(signals.iter().cloned());
        signals
    }

    /// Flatten a symbol's position at the next day's opening price. Emits a
    /// single SELL_CLOSE for the aggregate quantity, or `None` when the
    /// symbol holds nothing.
    pub fn on_day_open(
        &self,
        symbol: &str,
        open_price: f64,
        timestamp: NaiveDateTime,
    ) -> Option<Signal> {
        let symbol = normalize_symbol(symbol);
        let mut states = self.states.write();
        let st = states.get_mut(&symbol)?;
        if !st.has_position() {
            return None;
        }

        let base_price = st.base_price.unwrap_or(0.0);
        let drop_pct = if base_price > 0.0 {
            (open_price - base_price) / base_price
        } else {
            0.0
        };

        let signal = Signal {
            signal_type: SignalType::SellClose,
            symbol: symbol.clone(),
            price: open_price,
            base_price,
            drop_pct,
            vwap: self.vwap.get_realtime_vwap(&symbol),
            level: st.entry_levels.iter().max().copied().unwrap_or(1),
            quantity: st.total_quantity(),
            timestamp,
        };

        st.state = StrategyState::Closing;
        st.entry_prices.clear();
        st.entry_quantities.clear();
        st.entry_levels.clear();
        st.signals_today.push(signal.clone());

        info!(
            symbol = %symbol,
            open_price,
            quantity = signal.quantity,
            "day-open close signal"
        );
        Some(signal)
    }

    /// Clear every symbol's state (full restart of the strategy day).
    pub fn reset(&self) {
        self.states.write().clear();
    }

    /// Per-symbol snapshot for status queries. Symbols with no state yet
    /// report as Idle.
    pub fn get_monitor_data(&self) -> Vec<SymbolMonitor> {
        let config = self.config.read();
        let states = self.states.read();

        config
            .normalized_symbols()
            .into_iter()
            .map(|symbol| match states.get(&symbol) {
                Some(st) => SymbolMonitor {
                    symbol: symbol.clone(),
                    state: st.state,
                    base_price: st.base_price,
                    avg_entry_price: st.avg_entry_price(),
                    total_quantity: st.total_quantity(),
                    signals_today: st.signals_today.len(),
                    alert_emitted: st.alert_emitted_today,
                },
                None => SymbolMonitor {
                    symbol: symbol.clone(),
                    state: StrategyState::Idle,
                    base_price: None,
                    avg_entry_price: None,
                    total_quantity: 0,
                    signals_today: 0,
                    alert_emitted: false,
                },
            })
            .collect()
    }

    /// Today's signals across all symbols, in emission order.
    pub fn get_today_signals(&self) -> Vec<Signal> {
        let states = self.states.read();
        let mut signals: Vec<Signal> = states
            .values()
            .flat_map(|st| st.signals_today.iter().cloned())
            .collect();
        signals.sort_by_key(|s| s.timestamp);
        signals
    }
}
