// =============================================================================
// Strategy Scheduler — wires data, strategy, positions, risk, notifications
// =============================================================================
//
// Owns the wall-clock lifecycle of a trading day:
//
//   00:00-00:01  reset daily flags
//   09:15-09:25  pre-market: reset risk/strategy/VWAP state (trading days)
//   09:30-09:35  day-open close: flatten overnight positions at the open
//   14:30-15:00  watch window (driven by bars from the data handler)
//   15:05-15:15  post-market: persist snapshots, prune old files
//
// Two workers run concurrently: the data handler's polling loop (which
// delivers bars into `on_minute_bar`) and the scheduler's own ~10 s loop
// for the time gates above. Signal effects (positions, risk, notifications)
// are applied synchronously in the bar callback; only a force-close runs on
// its own task because it needs fresh quotes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{EngineConfig, NotifyConfig, RiskConfig, StrategyConfig};
use crate::market_data::{BarStore, MinuteBar, MinuteDataHandler};
use crate::notify::{
    render_buy_signal, render_price_alert, render_sell_signal, NotificationSink, SignalData,
};
use crate::position::{PnlSummary, Position, PositionManager, TradeRecord};
use crate::provider::MarketDataProvider;
use crate::risk::{RiskEvent, RiskManager, RiskStatus};
use crate::strategy::{SettlementArbitrageStrategy, Signal, SignalType, SymbolMonitor};
use crate::vwap::VWAPCalculator;

/// Default starting equity for risk tracking.
const INITIAL_EQUITY: f64 = 500_000.0;
/// Bound on the main-loop join at shutdown.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbols: Vec<String>,
    pub threshold_1: f64,
    pub threshold_2: f64,
    pub alert_threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsStatus {
    pub open_count: u32,
    pub open_positions: Vec<Position>,
    pub margin_used: f64,
}

/// Full scheduler snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub started_at: Option<String>,
    pub heartbeat: Option<String>,
    pub config: ConfigSummary,
    pub strategy: Vec<SymbolMonitor>,
    pub positions: PositionsStatus,
    pub risk: RiskStatus,
    pub pnl_summary: PnlSummary,
    pub is_trading_time: bool,
    pub is_watch_period: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DailyFlags {
    pre_market_done: bool,
    post_market_done: bool,
    day_open_processed: HashMap<String, bool>,
}

pub struct StrategyScheduler {
    provider: Arc<dyn MarketDataProvider>,
    data_handler: Arc<MinuteDataHandler>,
    vwap: Arc<VWAPCalculator>,
    strategy: Arc<SettlementArbitrageStrategy>,
    positions: Arc<PositionManager>,
    risk: Arc<RiskManager>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,

    strategy_config: RwLock<StrategyConfig>,
    risk_config: RwLock<RiskConfig>,
    notify_config: RwLock<NotifyConfig>,
    poll_interval_secs: u64,

    running: AtomicBool,
    main_task: Mutex<Option<JoinHandle<()>>>,
    started_at: RwLock<Option<DateTime<Local>>>,
    heartbeat: RwLock<Option<DateTime<Local>>>,
    flags: RwLock<DailyFlags>,

    /// Self-reference for spawning follow-up tasks from sync callbacks.
    weak_self: Weak<StrategyScheduler>,
}

impl StrategyScheduler {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let store = BarStore::new(&config.data_dir);
        let data_handler = Arc::new(MinuteDataHandler::new(
            provider.clone(),
            store,
            clock.clone(),
        ));
        let vwap = Arc::new(VWAPCalculator::new(provider.clone()));
        let strategy = Arc::new(SettlementArbitrageStrategy::new(
            config.strategy.clone(),
            vwap.clone(),
        ));
        let positions = Arc::new(PositionManager::new(clock.clone()));
        let risk = Arc::new(RiskManager::new(
            config.risk.clone(),
            config.strategy.clone(),
            clock.clone(),
        ));

        Arc::new_cyclic(|weak| Self {
            provider,
            data_handler,
            vwap,
            strategy,
            positions,
            risk,
            sink,
            clock,
            strategy_config: RwLock::new(config.strategy),
            risk_config: RwLock::new(config.risk),
            notify_config: RwLock::new(config.notify),
            poll_interval_secs: config.poll_interval_secs,
            running: AtomicBool::new(false),
            main_task: Mutex::new(None),
            started_at: RwLock::new(None),
            heartbeat: RwLock::new(None),
            flags: RwLock::new(DailyFlags::default()),
            weak_self: weak.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Component accessors (for status endpoints and tests)
    // -------------------------------------------------------------------------

    pub fn data_handler(&self) -> &Arc<MinuteDataHandler> {
        &self.data_handler
    }

    pub fn strategy(&self) -> &Arc<SettlementArbitrageStrategy> {
        &self.strategy
    }

    pub fn position_manager(&self) -> &Arc<PositionManager> {
        &self.positions
    }

    pub fn risk_manager(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Validate configs, wire components, and launch both workers.
    /// Invalid config refuses to start with no partial effects.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let strategy_config = self.strategy_config.read();
            let risk_config = self.risk_config.read();
            strategy_config.validate()?;
            risk_config.validate()?;
        }

        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return Ok(());
        }

        info!("scheduler starting");

        self.risk.initialize(INITIAL_EQUITY);
        self.risk.reset_daily();

        let symbols = self.strategy_config.read().normalized_symbols();
        self.data_handler.subscribe(&symbols);

        // Bar callback holds only a weak reference; the handler outliving the
        // scheduler must not keep it alive.
        let weak: Weak<Self> = Arc::downgrade(self);
        self.data_handler.on_bar(move |bar| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_minute_bar(bar);
            }
        });

        self.data_handler.start_polling(self.poll_interval_secs);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.main_loop().await;
        });
        *self.main_task.lock() = Some(handle);
        *self.started_at.write() = Some(self.clock.now());

        info!(symbols = ?symbols, "scheduler started");
        Ok(())
    }

    /// Stop both workers, persist snapshots, and join (bounded).
    pub async fn stop(&self) {
        info!("scheduler stopping");
        self.running.store(false, Ordering::SeqCst);

        self.data_handler.stop().await;
        self.data_handler.save_all_and_cleanup();

        let handle = self.main_task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("main loop did not stop within the join timeout");
            }
        }
        info!("scheduler stopped");
    }

    /// Hot-update configs. Validation failures leave everything untouched.
    pub fn update_config(
        &self,
        strategy: Option<StrategyConfig>,
        risk: Option<RiskConfig>,
    ) -> anyhow::Result<()> {
        if let Some(config) = &strategy {
            config.validate()?;
        }
        if let Some(config) = &risk {
            config.validate()?;
        }

        if let Some(config) = strategy {
            let symbols_changed = {
                let current = self.strategy_config.read();
                current.normalized_symbols() != config.normalized_symbols()
            };

            self.strategy.set_config(config.clone());
            self.risk.set_configs(None, Some(config.clone()));
            if symbols_changed {
                self.data_handler.subscribe(&config.normalized_symbols());
            }
            *self.strategy_config.write() = config;
            info!("strategy config updated");
        }

        if let Some(config) = risk {
            self.risk.set_configs(Some(config.clone()), None);
            *self.risk_config.write() = config;
            info!("risk config updated");
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    async fn main_loop(self: Arc<Self>) {
        let t_0001 = NaiveTime::from_hms_opt(0, 1, 0).unwrap();
        let t_0915 = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
        let t_0925 = NaiveTime::from_hms_opt(9, 25, 0).unwrap();
        let t_0930 = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let t_0935 = NaiveTime::from_hms_opt(9, 35, 0).unwrap();
        let t_1505 = NaiveTime::from_hms_opt(15, 5, 0).unwrap();
        let t_1515 = NaiveTime::from_hms_opt(15, 15, 0).unwrap();

        while self.running.load(Ordering::SeqCst) {
            let now = self.clock.now();
            *self.heartbeat.write() = Some(now);
            let t = now.time();

            if t < t_0001 {
                self.reset_daily_flags();
            }

            if t_0915 <= t && t < t_0925 && !self.flags.read().pre_market_done {
                self.pre_market().await;
            }

            if t_0930 <= t && t < t_0935 {
                self.check_day_open_close().await;
            }

            if t_1505 <= t && t < t_1515 && !self.flags.read().post_market_done {
                self.post_market();
            }

            // Interruptible ~10 s sleep.
            for _ in 0..10 {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    fn reset_daily_flags(&self) {
        let mut flags = self.flags.write();
        flags.pre_market_done = false;
        flags.post_market_done = false;
        flags.day_open_processed.clear();
    }

    /// Pre-market preparation (~09:15): reset daily state for trading days.
    pub(crate) async fn pre_market(&self) {
        info!("pre-market preparation");

        if !self.provider.is_trading_day(self.clock.today()).await {
            info!("not a trading day, skipping pre-market reset");
            self.flags.write().pre_market_done = true;
            return;
        }

        self.risk.reset_daily();
        self.strategy.reset();
        self.vwap.reset_realtime(None);

        let mut flags = self.flags.write();
        flags.day_open_processed.clear();
        flags.pre_market_done = true;
        info!("pre-market done");
    }

    /// Day-open close (~09:30): flatten overnight positions at the opening
    /// quote. Symbols without a usable quote stay unprocessed and are
    /// retried on the next loop tick.
    pub(crate) async fn check_day_open_close(&self) {
        let symbols = self.strategy_config.read().normalized_symbols();

        for symbol in symbols {
            if self
                .flags
                .read()
                .day_open_processed
                .get(&symbol)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }

            if !self.positions.has_open_positions(Some(&symbol)) {
                continue;
            }

            let Some(quote) = self.data_handler.get_realtime_quote(&symbol).await else {
                warn!(symbol = %symbol, "no quote for day-open close");
                continue;
            };
            if quote.last <= 0.0 {
                continue;
            }

            let now = self.clock.now().naive_local();
            if let Some(signal) = self.strategy.on_day_open(&symbol, quote.last, now) {
                self.process_signal(&signal);
            }

            self.flags
                .write()
                .day_open_processed
                .insert(symbol.clone(), true);
            info!(symbol = %symbol, open = quote.last, "day-open close processed");
        }
    }

    /// Post-market (~15:05): persist the day's bars and prune old files.
    pub(crate) fn post_market(&self) {
        info!("post-market cleanup");
        self.data_handler.save_all_and_cleanup();
        self.flags.write().post_market_done = true;
        info!("post-market done");
    }

    // -------------------------------------------------------------------------
    // Bar and signal handling
    // -------------------------------------------------------------------------

    /// Entry point for every new bar from the data handler.
    pub(crate) fn on_minute_bar(&self, bar: &MinuteBar) {
        let signals = self.strategy.on_bar(bar);
        for signal in &signals {
            self.process_signal(signal);
        }

        if self.positions.has_open_positions(None) {
            if let Some(event) = self.risk.check_all_risks() {
                if self.risk_config.read().force_close_on_limit {
                    self.spawn_risk_handler(event);
                }
            }
        }
    }

    /// Route one signal to positions/risk/notifications. Effects are applied
    /// before this returns.
    pub(crate) fn process_signal(&self, signal: &Signal) {
        match signal.signal_type {
            SignalType::BuyL1 | SignalType::BuyL2 => {
                if let Some(event) = self.risk.check_position_limit(&signal.symbol, &self.positions)
                {
                    warn!(
                        symbol = %signal.symbol,
                        reason = %event.message,
                        "entry blocked by risk"
                    );
                    return;
                }

                self.positions.open_position(
                    &signal.symbol,
                    signal.price,
                    signal.quantity,
                    signal.level,
                    signal.base_price,
                    signal.drop_pct,
                    signal.vwap,
                    Some(signal.timestamp),
                );

                if self.strategy_config.read().notify_on_entry {
                    let message = render_buy_signal(&self.signal_data(signal));
                    self.sink.dispatch(&self.notify_config.read(), &message);
                }
            }

            SignalType::SellClose => {
                let trades = self.positions.close_all_positions(
                    signal.price,
                    Some(&signal.symbol),
                    Some(signal.timestamp),
                );
                for trade in &trades {
                    self.risk.on_trade(trade);
                }

                if !trades.is_empty() && self.strategy_config.read().notify_on_exit {
                    let message = render_sell_signal(&self.sell_data(signal, &trades));
                    self.sink.dispatch(&self.notify_config.read(), &message);
                }
            }

            SignalType::Alert => {
                if self.strategy_config.read().notify_on_alert {
                    let mut data = self.signal_data(signal);
                    data.buy_threshold = Some(self.strategy_config.read().threshold_1);
                    let message = render_price_alert(&data);
                    self.sink.dispatch(&self.notify_config.read(), &message);
                }
            }
        }
    }

    fn signal_data(&self, signal: &Signal) -> SignalData {
        SignalData {
            symbol: signal.symbol.clone(),
            current_price: signal.price,
            base_price: signal.base_price,
            drop_pct: signal.drop_pct,
            timestamp: signal.timestamp,
            entry_price: None,
            profit: None,
            profit_pct: None,
            monthly_pnl: None,
            buy_threshold: None,
        }
    }

    fn sell_data(&self, signal: &Signal, trades: &[TradeRecord]) -> SignalData {
        let total_pnl: f64 = trades.iter().map(|t| t.net_pnl).sum();
        let total_qty: u32 = trades.iter().map(|t| t.position.quantity).sum();
        let avg_entry = if total_qty > 0 {
            trades
                .iter()
                .map(|t| t.position.entry_price * t.position.quantity as f64)
                .sum::<f64>()
                / total_qty as f64
        } else {
            0.0
        };
        let profit_pct = if avg_entry > 0.0 {
            (signal.price - avg_entry) / avg_entry
        } else {
            0.0
        };

        let mut data = self.signal_data(signal);
        data.entry_price = Some(avg_entry);
        data.profit = Some(total_pnl);
        data.profit_pct = Some(profit_pct);
        data
    }

    // -------------------------------------------------------------------------
    // Risk handling
    // -------------------------------------------------------------------------

    fn spawn_risk_handler(&self, event: RiskEvent) {
        // Quote fetches are async; run the force-close on its own task so
        // the bar callback returns promptly.
        let Some(scheduler) = self.weak_self.upgrade() else {
            error!("risk handler could not obtain scheduler reference");
            return;
        };
        tokio::spawn(async move {
            scheduler.handle_risk_event(event).await;
        });
    }

    /// Force-close everything a quote is available for; symbols without a
    /// valid quote are left open and re-attempted on the next breach cycle.
    pub(crate) async fn handle_risk_event(&self, event: RiskEvent) {
        warn!(reason = %event.message, "risk event triggered, force closing");

        let symbols = self.strategy_config.read().normalized_symbols();
        let mut prices = HashMap::new();
        for symbol in symbols {
            if let Some(quote) = self.data_handler.get_realtime_quote(&symbol).await {
                if quote.last > 0.0 {
                    prices.insert(symbol, quote.last);
                }
            }
        }

        let trades = self
            .risk
            .force_close_all(&self.positions, &prices, &event.message);
        warn!(
            closed = trades.len(),
            total_pnl = format!("{:.2}", trades.iter().map(|t| t.net_pnl).sum::<f64>()),
            "force close complete"
        );
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn get_status(&self) -> SchedulerStatus {
        let strategy_config = self.strategy_config.read();
        let now = self.clock.now().time();

        SchedulerStatus {
            is_running: self.is_running(),
            started_at: self.started_at.read().map(|t| t.to_rfc3339()),
            heartbeat: self.heartbeat.read().map(|t| t.to_rfc3339()),
            config: ConfigSummary {
                symbols: strategy_config.normalized_symbols(),
                threshold_1: strategy_config.threshold_1,
                threshold_2: strategy_config.threshold_2,
                alert_threshold: strategy_config.alert_threshold,
            },
            strategy: self.strategy.get_monitor_data(),
            positions: PositionsStatus {
                open_count: self.positions.get_position_count(None),
                open_positions: self.positions.get_current_positions(None),
                margin_used: self.positions.get_total_margin_used(),
            },
            risk: self.risk.get_risk_status(),
            pnl_summary: self.positions.get_pnl_summary(),
            is_trading_time: self.provider.is_trading_time(now),
            is_watch_period: self.provider.is_watch_period(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Global accessor (optional convenience for UI queries)
// ---------------------------------------------------------------------------

static GLOBAL_SCHEDULER: Mutex<Option<Arc<StrategyScheduler>>> = Mutex::new(None);

/// The installed scheduler, if any. Components never reach for this —
/// it exists for status endpoints and CLI wrappers only.
pub fn get_scheduler() -> Option<Arc<StrategyScheduler>> {
    GLOBAL_SCHEDULER.lock().clone()
}

/// Build a scheduler, install it globally (stopping any previous one), and
/// return it.
pub async fn create_scheduler(
    provider: Arc<dyn MarketDataProvider>,
    sink: Arc<dyn NotificationSink>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
) -> Arc<StrategyScheduler> {
    let previous = GLOBAL_SCHEDULER.lock().take();
    if let Some(previous) = previous {
        if previous.is_running() {
            previous.stop().await;
        }
    }

    let scheduler = StrategyScheduler::new(provider, sink, config, clock);
    *GLOBAL_SCHEDULER.lock() = Some(scheduler.clone());
    scheduler
}
