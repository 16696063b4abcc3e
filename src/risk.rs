// =============================================================================
// Risk Manager — daily loss, drawdown, and position caps with force-close
// =============================================================================
//
// Limits enforced:
//   1. Daily Loss   — fires when daily P&L falls strictly below -max_daily_loss.
//   2. Drawdown     — fires when (peak - current) / peak strictly exceeds
//                     max_drawdown (no event while peak equity is zero).
//   3. Position     — per-symbol cap checked before the total cap; both fire
//                     at >= the limit (the next open would exceed it).
//
// A breach is not an error: checks return `Option<RiskEvent>` and the
// scheduler decides whether to force-close. Any firing check latches
// `is_risk_triggered` until `reset_daily` or `reset`.
//
// Daily counters roll over automatically when a trade arrives on a new date.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{RiskConfig, StrategyConfig};
use crate::position::{PositionManager, TradeRecord};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventType {
    PositionLimit,
    DailyLossLimit,
    DrawdownLimit,
    ForceClose,
}

/// One entry in the append-only risk event log.
#[derive(Debug, Clone, Serialize)]
pub struct RiskEvent {
    pub event_type: RiskEventType,
    pub message: String,
    /// The observed value that triggered the event.
    pub value: f64,
    /// The limit it was compared against.
    pub limit: f64,
    pub timestamp: NaiveDateTime,
    pub action_taken: Option<String>,
}

/// Snapshot of the risk state for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub is_risk_triggered: bool,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub daily_loss_limit: f64,
    pub daily_loss_remaining: f64,
    pub current_equity: f64,
    pub peak_equity: f64,
    pub current_drawdown: f64,
    pub max_drawdown_limit: f64,
    pub total_risk_events: usize,
}

// ---------------------------------------------------------------------------
// Internal mutable state
// ---------------------------------------------------------------------------

struct Inner {
    daily_pnl: f64,
    daily_trades: u32,
    current_date: Option<NaiveDate>,
    initial_equity: f64,
    current_equity: f64,
    peak_equity: f64,
    events: Vec<RiskEvent>,
    triggered: bool,
}

// ---------------------------------------------------------------------------
// Risk Manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    risk_config: RwLock<RiskConfig>,
    strategy_config: RwLock<StrategyConfig>,
    clock: Arc<dyn Clock>,
    state: RwLock<Inner>,
}

impl RiskManager {
    pub fn new(
        risk_config: RiskConfig,
        strategy_config: StrategyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            risk_config: RwLock::new(risk_config),
            strategy_config: RwLock::new(strategy_config),
            clock,
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                daily_trades: 0,
                current_date: None,
                initial_equity: 0.0,
                current_equity: 0.0,
                peak_equity: 0.0,
                events: Vec::new(),
                triggered: false,
            }),
        }
    }

    /// Replace the limit configs (hot update from the scheduler).
    pub fn set_configs(&self, risk: Option<RiskConfig>, strategy: Option<StrategyConfig>) {
        if let Some(risk) = risk {
            *self.risk_config.write() = risk;
        }
        if let Some(strategy) = strategy {
            *self.strategy_config.write() = strategy;
        }
    }

    pub fn is_risk_triggered(&self) -> bool {
        self.state.read().triggered
    }

    /// Set the starting equity and clear the event log and latch.
    pub fn initialize(&self, initial_equity: f64) {
        let mut s = self.state.write();
        s.initial_equity = initial_equity;
        s.current_equity = initial_equity;
        s.peak_equity = initial_equity;
        s.events.clear();
        s.triggered = false;
        info!(initial_equity, "risk manager initialised");
    }

    /// Zero the daily counters. Called at the start of each trading day.
    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        s.daily_pnl = 0.0;
        s.daily_trades = 0;
        s.current_date = Some(self.clock.today());
        s.triggered = false;
        info!("daily risk counters reset");
    }

    // -------------------------------------------------------------------------
    // Trade recording
    // -------------------------------------------------------------------------

    /// Fold a completed trade into the daily P&L and equity tracking.
    pub fn on_trade(&self, trade: &TradeRecord) {
        let today = self.clock.today();
        if self.state.read().current_date != Some(today) {
            self.reset_daily();
        }

        let mut s = self.state.write();
        s.daily_pnl += trade.net_pnl;
        s.daily_trades += 1;

        s.current_equity += trade.net_pnl;
        if s.current_equity > s.peak_equity {
            s.peak_equity = s.current_equity;
        }

        info!(
            net_pnl = format!("{:.2}", trade.net_pnl),
            daily_pnl = format!("{:.2}", s.daily_pnl),
            equity = format!("{:.2}", s.current_equity),
            "trade recorded"
        );
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    /// Daily loss first, then drawdown; first hit wins.
    pub fn check_all_risks(&self) -> Option<RiskEvent> {
        self.check_daily_loss_limit()
            .or_else(|| self.check_drawdown_limit())
    }

    /// Fires when daily P&L is strictly below the negated limit.
    pub fn check_daily_loss_limit(&self) -> Option<RiskEvent> {
        let max_daily_loss = self.risk_config.read().max_daily_loss;
        let mut s = self.state.write();

        if s.daily_pnl >= -max_daily_loss {
            return None;
        }

        let event = RiskEvent {
            event_type: RiskEventType::DailyLossLimit,
            message: format!(
                "daily loss limit exceeded: pnl={:.2}, limit={:.2}",
                s.daily_pnl, -max_daily_loss
            ),
            value: s.daily_pnl,
            limit: -max_daily_loss,
            timestamp: self.clock.now().naive_local(),
            action_taken: None,
        };
        error!("{}", event.message);
        s.triggered = true;
        s.events.push(event.clone());
        Some(event)
    }

    /// Fires when peak-to-current drawdown strictly exceeds the limit.
    pub fn check_drawdown_limit(&self) -> Option<RiskEvent> {
        let max_drawdown = self.risk_config.read().max_drawdown;
        let mut s = self.state.write();

        if s.peak_equity <= 0.0 {
            return None;
        }
        let drawdown = (s.peak_equity - s.current_equity) / s.peak_equity;
        if drawdown <= max_drawdown {
            return None;
        }

        let event = RiskEvent {
            event_type: RiskEventType::DrawdownLimit,
            message: format!(
                "drawdown limit exceeded: drawdown={:.2}%, limit={:.2}%",
                drawdown * 100.0,
                max_drawdown * 100.0
            ),
            value: drawdown,
            limit: max_drawdown,
            timestamp: self.clock.now().naive_local(),
            action_taken: None,
        };
        error!("{}", event.message);
        s.triggered = true;
        s.events.push(event.clone());
        Some(event)
    }

    /// Would opening one more position on `symbol` breach a cap?
    /// Per-symbol limit is checked before the total limit.
    pub fn check_position_limit(
        &self,
        symbol: &str,
        positions: &PositionManager,
    ) -> Option<RiskEvent> {
        let max_per_symbol = self.strategy_config.read().max_position_per_symbol;
        let max_total = self.risk_config.read().max_total_position;

        let symbol_qty = positions.get_position_count(Some(symbol));
        if symbol_qty >= max_per_symbol {
            return Some(self.record_position_limit(
                format!("position limit for {symbol}: {symbol_qty}/{max_per_symbol}"),
                symbol_qty,
                max_per_symbol,
            ));
        }

        let total_qty = positions.get_position_count(None);
        if total_qty >= max_total {
            return Some(self.record_position_limit(
                format!("total position limit: {total_qty}/{max_total}"),
                total_qty,
                max_total,
            ));
        }

        None
    }

    fn record_position_limit(&self, message: String, value: u32, limit: u32) -> RiskEvent {
        let event = RiskEvent {
            event_type: RiskEventType::PositionLimit,
            message,
            value: value as f64,
            limit: limit as f64,
            timestamp: self.clock.now().naive_local(),
            action_taken: None,
        };
        warn!("{}", event.message);
        let mut s = self.state.write();
        s.triggered = true;
        s.events.push(event.clone());
        event
    }

    // -------------------------------------------------------------------------
    // Force close
    // -------------------------------------------------------------------------

    /// Close all positions for every symbol a price is known for, record a
    /// single FORCE_CLOSE event summarising the aggregate P&L, and fold the
    /// resulting trades into the daily tracking.
    pub fn force_close_all(
        &self,
        positions: &PositionManager,
        current_prices: &HashMap<String, f64>,
        reason: &str,
    ) -> Vec<TradeRecord> {
        let now = self.clock.now().naive_local();

        let mut symbols: Vec<&String> = current_prices.keys().collect();
        symbols.sort();

        let mut all_trades = Vec::new();
        for symbol in symbols {
            let price = current_prices[symbol];
            all_trades.extend(positions.close_all_positions(price, Some(symbol), Some(now)));
        }

        if !all_trades.is_empty() {
            let total_pnl: f64 = all_trades.iter().map(|t| t.net_pnl).sum();
            let event = RiskEvent {
                event_type: RiskEventType::ForceClose,
                message: format!("force closed {} positions: {reason}", all_trades.len()),
                value: total_pnl,
                limit: 0.0,
                timestamp: now,
                action_taken: Some("force_close".to_string()),
            };
            warn!("{}", event.message);
            self.state.write().events.push(event);

            for trade in &all_trades {
                self.on_trade(trade);
            }
        }

        all_trades
    }

    // -------------------------------------------------------------------------
    // Status & reporting
    // -------------------------------------------------------------------------

    pub fn get_risk_status(&self) -> RiskStatus {
        let risk_config = self.risk_config.read();
        let s = self.state.read();

        let drawdown = if s.peak_equity > 0.0 {
            (s.peak_equity - s.current_equity) / s.peak_equity
        } else {
            0.0
        };

        RiskStatus {
            is_risk_triggered: s.triggered,
            daily_pnl: round2(s.daily_pnl),
            daily_trades: s.daily_trades,
            daily_loss_limit: risk_config.max_daily_loss,
            daily_loss_remaining: round2(risk_config.max_daily_loss + s.daily_pnl),
            current_equity: round2(s.current_equity),
            peak_equity: round2(s.peak_equity),
            current_drawdown: round6(drawdown),
            max_drawdown_limit: risk_config.max_drawdown,
            total_risk_events: s.events.len(),
        }
    }

    /// Event history, most recent first, optionally filtered by type.
    pub fn get_events(&self, event_type: Option<RiskEventType>, limit: usize) -> Vec<RiskEvent> {
        let s = self.state.read();
        let mut events: Vec<RiskEvent> = s
            .events
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        events.reverse();
        events.truncate(limit);
        events
    }

    /// Full reset: counters, equity tracking, event log, latch.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.daily_pnl = 0.0;
        s.daily_trades = 0;
        s.current_date = None;
        s.initial_equity = 0.0;
        s.current_equity = 0.0;
        s.peak_equity = 0.0;
        s.events.clear();
        s.triggered = false;
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
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (RiskManager, PositionManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            chrono::Local.with_ymd_and_hms(2026, 2, 9, 14, 40, 0).unwrap(),
        ));
        let rm = RiskManager::new(
            RiskConfig::default(),
            StrategyConfig::default(),
            clock.clone(),
        );
        rm.initialize(500_000.0);
        rm.reset_daily();
        let pm = PositionManager::new(clock.clone());
        (rm, pm, clock)
    }

    /// Round-trip a synthetic trade with roughly the requested net P&L.
    fn trade_with_pnl(pm: &PositionManager, rm: &RiskManager, target: f64) {
        let entry = 5000.0;
        // gross = (exit - entry) * 200; invert for the requested target,
        // nudged up to absorb fees.
        let exit = entry + (target + 60.0) / 200.0;
        let pos = pm.open_position("IM0", entry, 1, 1, 5100.0, -0.01, None, None);
        let trade = pm.close_position(&pos.id, exit, None).unwrap();
        rm.on_trade(&trade);
    }

    #[test]
    fn daily_loss_is_strict() {
        let (rm, _pm, _clock) = setup();

        // Exactly at the limit: must NOT fire.
        {
            let mut s = rm.state.write();
            s.daily_pnl = -10_000.0;
        }
        assert!(rm.check_daily_loss_limit().is_none());
        assert!(!rm.is_risk_triggered());

        // Strictly below: fires and latches.
        {
            let mut s = rm.state.write();
            s.daily_pnl = -10_000.01;
        }
        let event = rm.check_daily_loss_limit().unwrap();
        assert_eq!(event.event_type, RiskEventType::DailyLossLimit);
        assert!(rm.is_risk_triggered());

        // Latch persists through repeated checks until reset_daily.
        assert!(rm.check_all_risks().is_some());
        rm.reset_daily();
        assert!(!rm.is_risk_triggered());
    }

    #[test]
    fn drawdown_requires_positive_peak_and_is_strict() {
        let (rm, _pm, _clock) = setup();

        // Zero peak equity -> no event.
        rm.reset();
        assert!(rm.check_drawdown_limit().is_none());

        rm.initialize(100_000.0);
        rm.reset_daily();

        // Exactly at the 5% limit: no event.
        {
            let mut s = rm.state.write();
            s.current_equity = 95_000.0;
        }
        assert!(rm.check_drawdown_limit().is_none());

        // Beyond it: fires.
        {
            let mut s = rm.state.write();
            s.current_equity = 94_000.0;
        }
        let event = rm.check_drawdown_limit().unwrap();
        assert_eq!(event.event_type, RiskEventType::DrawdownLimit);
        assert!((event.value - 0.06).abs() < 1e-12);
    }

    #[test]
    fn position_limits_check_symbol_before_total() {
        let (rm, pm, _clock) = setup();

        // max_position_per_symbol = 2 (default).
        pm.open_position("IM0", 5800.0, 2, 1, 5900.0, -0.01, None, None);
        let event = rm.check_position_limit("IM0", &pm).unwrap();
        assert_eq!(event.event_type, RiskEventType::PositionLimit);
        assert!(event.message.contains("IM0"));

        // Another symbol is still under its own cap but total (4) is reached.
        pm.open_position("IC0", 5500.0, 2, 1, 5550.0, -0.01, None, None);
        let event = rm.check_position_limit("IF0", &pm).unwrap();
        assert!(event.message.contains("total"));

        // A fresh book under both caps -> no event.
        let pm2 = PositionManager::new(Arc::new(ManualClock::new(
            chrono::Local.with_ymd_and_hms(2026, 2, 9, 14, 40, 0).unwrap(),
        )));
        pm2.open_position("IM0", 5800.0, 1, 1, 5900.0, -0.01, None, None);
        assert!(rm.check_position_limit("IM0", &pm2).is_none());
    }

    #[test]
    fn on_trade_tracks_equity_and_peak_only_upward() {
        let (rm, pm, _clock) = setup();

        trade_with_pnl(&pm, &rm, 5_000.0);
        let status = rm.get_risk_status();
        assert!(status.current_equity > 500_000.0);
        assert_eq!(status.peak_equity, status.current_equity);
        assert_eq!(status.daily_trades, 1);

        let peak_before = status.peak_equity;
        trade_with_pnl(&pm, &rm, -8_000.0);
        let status = rm.get_risk_status();
        assert!(status.current_equity < peak_before);
        assert_eq!(status.peak_equity, peak_before);
    }

    #[test]
    fn on_trade_rolls_daily_counters_on_date_change() {
        let (rm, pm, clock) = setup();

        trade_with_pnl(&pm, &rm, -2_000.0);
        assert_eq!(rm.get_risk_status().daily_trades, 1);

        clock.set(chrono::Local.with_ymd_and_hms(2026, 2, 10, 9, 30, 0).unwrap());
        trade_with_pnl(&pm, &rm, -1_000.0);

        let status = rm.get_risk_status();
        assert_eq!(status.daily_trades, 1);
        assert!(status.daily_pnl > -2_000.0);
    }

    #[test]
    fn force_close_all_records_event_and_feeds_trades() {
        let (rm, pm, _clock) = setup();
        pm.open_position("IM0", 5840.0, 1, 1, 5900.0, -0.01, None, None);
        pm.open_position("IC0", 5500.0, 1, 1, 5550.0, -0.01, None, None);

        let mut prices = HashMap::new();
        prices.insert("IM0".to_string(), 5800.0);
        // No quote for IC0 -> its position must survive.

        let trades = rm.force_close_all(&pm, &prices, "daily loss limit exceeded");
        assert_eq!(trades.len(), 1);
        assert!(pm.has_open_positions(Some("IC0")));
        assert!(!pm.has_open_positions(Some("IM0")));

        let events = rm.get_events(Some(RiskEventType::ForceClose), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_taken.as_deref(), Some("force_close"));
        assert_eq!(rm.get_risk_status().daily_trades, 1);
    }

    #[test]
    fn events_are_most_recent_first_and_limited() {
        let (rm, _pm, _clock) = setup();
        {
            let mut s = rm.state.write();
            s.daily_pnl = -20_000.0;
        }
        rm.check_daily_loss_limit();
        {
            let mut s = rm.state.write();
            s.current_equity = 400_000.0;
        }
        rm.check_drawdown_limit();

        let events = rm.get_events(None, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, RiskEventType::DrawdownLimit);
        assert_eq!(events[1].event_type, RiskEventType::DailyLossLimit);

        let limited = rm.get_events(None, 1);
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn reset_daily_is_idempotent() {
        let (rm, pm, _clock) = setup();
        trade_with_pnl(&pm, &rm, -500.0);

        rm.reset_daily();
        let first = rm.get_risk_status();
        rm.reset_daily();
        let second = rm.get_risk_status();

        assert_eq!(first.daily_pnl, second.daily_pnl);
        assert_eq!(first.daily_trades, second.daily_trades);
        assert_eq!(first.is_risk_triggered, second.is_risk_triggered);
    }
}
