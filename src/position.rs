// =============================================================================
// Position Manager — authoritative ledger of open positions and closed trades
// =============================================================================
//
// Life-cycle: Open -> Closed (day-open flatten, or risk force-close).
// Entries are always long; the overnight hold from the 14:30 window to the
// next day's open is the whole strategy.
//
// P&L model (per CFFEX conventions):
//   gross = (exit - entry) * quantity * multiplier
//   fee   = entry * multiplier * qty * open_rate
//         + exit  * multiplier * qty * close_rate
//   where close_rate is the close-today rate when the exit lands on the
//   entry date (force-close path) and the overnight rate otherwise.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`. The
// manager never checks risk limits — that is the risk manager's job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::types::{product_spec, spec_for_symbol, ProductSpec};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single tracked position. Mutated only by `close_position`, frozen
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// 8-char UUID prefix.
    pub id: String,
    pub symbol: String,
    pub direction: PositionDirection,
    /// Lots.
    pub quantity: u32,
    pub entry_price: f64,
    pub entry_time: NaiveDateTime,
    /// Entry level: 1 = first, 2 = add-on.
    pub level: u8,
    /// 14:30 base price when the signal triggered.
    pub base_price: f64,
    /// Drop from base price at entry.
    pub drop_pct: f64,
    /// Realtime VWAP at entry, when known.
    #[serde(default)]
    pub vwap: Option<f64>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<NaiveDateTime>,
    pub status: PositionStatus,
    /// Net realised P&L, set on close.
    #[serde(default)]
    pub pnl: f64,
    /// Total round-trip fee, set on close.
    #[serde(default)]
    pub fee: f64,
    /// Margin requirement at entry.
    pub margin: f64,
}

/// A completed round trip (entry + exit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position: Position,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub holding_hours: f64,
}

/// Aggregate statistics over the closed-trade history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PnlSummary {
    pub total_trades: usize,
    pub total_pnl: f64,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_fees: f64,
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

struct Inner {
    open: HashMap<String, Position>,
    history: Vec<TradeRecord>,
}

pub struct PositionManager {
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

/// Unknown products fall back to the IM schedule, matching the most common
/// contracts this engine trades.
fn spec_or_default(symbol: &str) -> &'static ProductSpec {
    spec_for_symbol(symbol).unwrap_or_else(|| product_spec("IM").unwrap())
}

impl PositionManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(Inner {
                open: HashMap::new(),
                history: Vec::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open a long position and return a copy of it.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        symbol: &str,
        price: f64,
        quantity: u32,
        level: u8,
        base_price: f64,
        drop_pct: f64,
        vwap: Option<f64>,
        timestamp: Option<NaiveDateTime>,
    ) -> Position {
        assert!(quantity > 0, "position quantity must be positive");

        let entry_time = timestamp.unwrap_or_else(|| self.clock.now().naive_local());
        let spec = spec_or_default(symbol);
        let margin = price * spec.multiplier * quantity as f64 * spec.margin_ratio;

        let position = Position {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            symbol: symbol.to_string(),
            direction: PositionDirection::Long,
            quantity,
            entry_price: price,
            entry_time,
            level,
            base_price,
            drop_pct,
            vwap,
            exit_price: None,
            exit_time: None,
            status: PositionStatus::Open,
            pnl: 0.0,
            fee: 0.0,
            margin,
        };

        info!(
            id = %position.id,
            symbol,
            level,
            quantity,
            price,
            margin = format!("{margin:.0}"),
            "position opened"
        );

        self.inner
            .write()
            .open
            .insert(position.id.clone(), position.clone());
        position
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close an open position by id. `None` for an unknown (or already
    /// closed) id.
    pub fn close_position(
        &self,
        position_id: &str,
        exit_price: f64,
        timestamp: Option<NaiveDateTime>,
    ) -> Option<TradeRecord> {
        let exit_time = timestamp.unwrap_or_else(|| self.clock.now().naive_local());

        let mut inner = self.inner.write();
        let Some(mut position) = inner.open.remove(position_id) else {
            warn!(position_id, "close requested for unknown position");
            return None;
        };

        let spec = spec_or_default(&position.symbol);
        let qty = position.quantity as f64;

        let gross_pnl = (exit_price - position.entry_price) * qty * spec.multiplier;

        let is_close_today = exit_time.date() == position.entry_time.date();
        let close_rate = if is_close_today {
            spec.fee_close_today
        } else {
            spec.fee_close
        };
        let open_fee = position.entry_price * spec.multiplier * qty * spec.fee_open;
        let close_fee = exit_price * spec.multiplier * qty * close_rate;
        let fee = round2(open_fee + close_fee);

        let net_pnl = gross_pnl - fee;
        let holding_hours = (exit_time - position.entry_time).num_seconds() as f64 / 3600.0;

        position.exit_price = Some(exit_price);
        position.exit_time = Some(exit_time);
        position.status = PositionStatus::Closed;
        position.pnl = net_pnl;
        position.fee = fee;

        let trade = TradeRecord {
            position,
            gross_pnl,
            net_pnl,
            holding_hours,
        };
        inner.history.push(trade.clone());

        info!(
            position_id,
            symbol = %trade.position.symbol,
            exit_price,
            net_pnl = format!("{net_pnl:.2}"),
            fee = format!("{fee:.2}"),
            "position closed"
        );

        Some(trade)
    }

    /// Close every open position (optionally one symbol's), in entry order.
    pub fn close_all_positions(
        &self,
        exit_price: f64,
        symbol: Option<&str>,
        timestamp: Option<NaiveDateTime>,
    ) -> Vec<TradeRecord> {
        let mut ids: Vec<(NaiveDateTime, String)> = {
            let inner = self.inner.read();
            inner
                .open
                .values()
                .filter(|p| symbol.map_or(true, |s| p.symbol == s))
                .map(|p| (p.entry_time, p.id.clone()))
                .collect()
        };
        ids.sort();

        ids.into_iter()
            .filter_map(|(_, id)| self.close_position(&id, exit_price, timestamp))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_current_positions(&self, symbol: Option<&str>) -> Vec<Position> {
        let inner = self.inner.read();
        let mut positions: Vec<Position> = inner
            .open
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
        positions
    }

    /// Total open lots, optionally for one symbol.
    pub fn get_position_count(&self, symbol: Option<&str>) -> u32 {
        let inner = self.inner.read();
        inner
            .open
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .map(|p| p.quantity)
            .sum()
    }

    pub fn get_total_margin_used(&self) -> f64 {
        let inner = self.inner.read();
        inner.open.values().map(|p| p.margin).sum()
    }

    /// Mark-to-market P&L of a symbol's open positions at `current_price`.
    pub fn calculate_unrealized_pnl(&self, symbol: &str, current_price: f64) -> f64 {
        let spec = spec_or_default(symbol);
        let inner = self.inner.read();
        let total: f64 = inner
            .open
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| (current_price - p.entry_price) * p.quantity as f64 * spec.multiplier)
            .sum();
        round2(total)
    }

    /// Closed trades, most recent exit first.
    pub fn get_trade_history(
        &self,
        symbol: Option<&str>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        limit: usize,
    ) -> Vec<TradeRecord> {
        let inner = self.inner.read();
        let mut trades: Vec<TradeRecord> = inner
            .history
            .iter()
            .filter(|t| symbol.map_or(true, |s| t.position.symbol == s))
            .filter(|t| start.map_or(true, |s| t.position.entry_time >= s))
            .filter(|t| {
                end.map_or(true, |e| t.position.exit_time.map_or(false, |x| x <= e))
            })
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.position.exit_time.cmp(&a.position.exit_time));
        trades.truncate(limit);
        trades
    }

    pub fn get_pnl_summary(&self) -> PnlSummary {
        let inner = self.inner.read();
        let trades = &inner.history;
        if trades.is_empty() {
            return PnlSummary::default();
        }

        let wins: Vec<f64> = trades
            .iter()
            .map(|t| t.net_pnl)
            .filter(|p| *p > 0.0)
            .collect();
        let losses: Vec<f64> = trades
            .iter()
            .map(|t| t.net_pnl)
            .filter(|p| *p <= 0.0)
            .collect();

        PnlSummary {
            total_trades: trades.len(),
            total_pnl: round2(trades.iter().map(|t| t.net_pnl).sum()),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: round4(wins.len() as f64 / trades.len() as f64),
            avg_win: if wins.is_empty() {
                0.0
            } else {
                round2(wins.iter().sum::<f64>() / wins.len() as f64)
            },
            avg_loss: if losses.is_empty() {
                0.0
            } else {
                round2(losses.iter().sum::<f64>() / losses.len() as f64)
            },
            total_fees: round2(trades.iter().map(|t| t.position.fee).sum()),
        }
    }

    pub fn has_open_positions(&self, symbol: Option<&str>) -> bool {
        let inner = self.inner.read();
        match symbol {
            Some(s) => inner.open.values().any(|p| p.symbol == s),
            None => !inner.open.is_empty(),
        }
    }

    /// Drop all open positions and history.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.open.clear();
        inner.history.clear();
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
