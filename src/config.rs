// =============================================================================
// Engine configuration — strategy, risk, notification, and backtest settings
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Validation is preconditional: the scheduler refuses to start (and refuses
// a hot update) when a config fails `validate()`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::normalize_symbol;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["IM0".to_string(), "IC0".to_string()]
}

fn default_watch_start() -> NaiveTime {
    NaiveTime::from_hms_opt(14, 30, 0).unwrap()
}

fn default_watch_end() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap()
}

fn default_threshold_1() -> f64 {
    0.01
}

fn default_threshold_2() -> f64 {
    0.02
}

fn default_alert_threshold() -> f64 {
    0.008
}

fn default_position_size() -> u32 {
    1
}

fn default_max_position_per_symbol() -> u32 {
    2
}

fn default_max_daily_loss() -> f64 {
    10_000.0
}

fn default_max_drawdown() -> f64 {
    0.05
}

fn default_max_total_position() -> u32 {
    4
}

fn default_initial_capital() -> f64 {
    500_000.0
}

fn default_channels() -> Vec<String> {
    vec!["telegram".to_string()]
}

fn default_data_dir() -> String {
    "data/futures/minute".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// Parameters of the settlement-arbitrage signal logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Symbols to monitor (main-contract shorthand or month codes).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Start of the watch window — the first bar at or after this time
    /// anchors the day's base price.
    #[serde(default = "default_watch_start")]
    pub watch_start: NaiveTime,

    /// End of the watch window. No entry signals after this time.
    #[serde(default = "default_watch_end")]
    pub watch_end: NaiveTime,

    /// First-entry drop threshold as a fraction (0.01 = 1 %).
    #[serde(default = "default_threshold_1")]
    pub threshold_1: f64,

    /// Add-on drop threshold. Must be greater than `threshold_1`.
    #[serde(default = "default_threshold_2")]
    pub threshold_2: f64,

    /// Early-warning threshold, fired once per day before the first entry.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Lots for the first entry.
    #[serde(default = "default_position_size")]
    pub position_size_1: u32,

    /// Lots for the add-on entry.
    #[serde(default = "default_position_size")]
    pub position_size_2: u32,

    /// Maximum open lots per symbol.
    #[serde(default = "default_max_position_per_symbol")]
    pub max_position_per_symbol: u32,

    #[serde(default = "default_true")]
    pub notify_on_entry: bool,

    #[serde(default = "default_true")]
    pub notify_on_exit: bool,

    #[serde(default = "default_true")]
    pub notify_on_alert: bool,

    #[serde(default)]
    pub notify_daily_report: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            watch_start: default_watch_start(),
            watch_end: default_watch_end(),
            threshold_1: default_threshold_1(),
            threshold_2: default_threshold_2(),
            alert_threshold: default_alert_threshold(),
            position_size_1: default_position_size(),
            position_size_2: default_position_size(),
            max_position_per_symbol: default_max_position_per_symbol(),
            notify_on_entry: true,
            notify_on_exit: true,
            notify_on_alert: true,
            notify_daily_report: false,
        }
    }
}

impl StrategyConfig {
    /// Check invariants. Returns an error describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol must be specified");
        }
        if self.threshold_1 <= 0.0 || self.threshold_1 >= 1.0 {
            bail!("threshold_1 must be between 0 and 1");
        }
        if self.threshold_2 <= self.threshold_1 {
            bail!("threshold_2 must be greater than threshold_1");
        }
        if self.alert_threshold <= 0.0 || self.alert_threshold >= 1.0 {
            bail!("alert_threshold must be between 0 and 1");
        }
        if self.position_size_1 == 0 {
            bail!("position_size_1 must be positive");
        }
        if self.position_size_2 == 0 {
            bail!("position_size_2 must be positive");
        }
        if self.watch_start >= self.watch_end {
            bail!("watch_start must be before watch_end");
        }
        Ok(())
    }

    /// Normalized copy of the symbol list ("im" -> "IM0").
    pub fn normalized_symbols(&self) -> Vec<String> {
        self.symbols.iter().map(|s| normalize_symbol(s)).collect()
    }
}

// =============================================================================
// RiskConfig
// =============================================================================

/// Safety limits enforced by the risk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum daily loss in currency units. A daily P&L strictly below
    /// the negated limit trips the breaker.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Maximum peak-to-current drawdown as a fraction.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    /// Whether a tripped limit force-closes all positions.
    #[serde(default = "default_true")]
    pub force_close_on_limit: bool,

    /// Maximum total open lots across all symbols.
    #[serde(default = "default_max_total_position")]
    pub max_total_position: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_drawdown: default_max_drawdown(),
            force_close_on_limit: true,
            max_total_position: default_max_total_position(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_daily_loss <= 0.0 {
            bail!("max_daily_loss must be positive");
        }
        if self.max_drawdown <= 0.0 || self.max_drawdown >= 1.0 {
            bail!("max_drawdown must be between 0 and 1");
        }
        if self.max_total_position == 0 {
            bail!("max_total_position must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// NotifyConfig
// =============================================================================

/// Channel routing passed to the notification sink alongside each rendered
/// message. The sink decides which subset of channels to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    #[serde(default)]
    pub email_address: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            telegram_chat_id: None,
            email_address: None,
        }
    }
}

// =============================================================================
// BacktestConfig
// =============================================================================

/// Backtest-specific knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    /// Apply the exchange fee schedule to simulated trades.
    #[serde(default = "default_true")]
    pub use_default_commission: bool,

    /// Slippage in index points applied against each fill.
    #[serde(default)]
    pub slippage_points: f64,

    /// Refine the base price with local minute snapshots when available.
    #[serde(default = "default_true")]
    pub use_minute_data: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            use_default_commission: true,
            slippage_points: 0.0,
            use_minute_data: true,
        }
    }
}

// =============================================================================
// EngineConfig — top-level file
// =============================================================================

/// Everything the live engine reads from its config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    /// Root directory for minute-bar snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Data-handler polling cadence in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
            notify: NotifyConfig::default(),
            data_dir: default_data_dir(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.strategy.symbols,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        self.risk.validate()?;
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_config_is_valid() {
        let cfg = StrategyConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.symbols, vec!["IM0", "IC0"]);
        assert_eq!(cfg.watch_start, NaiveTime::from_hms_opt(14, 30, 0).unwrap());
        assert_eq!(cfg.watch_end, NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        assert_eq!(cfg.threshold_1, 0.01);
        assert_eq!(cfg.threshold_2, 0.02);
        assert_eq!(cfg.alert_threshold, 0.008);
        assert!(cfg.notify_on_entry);
    }

    #[test]
    fn strategy_validation_rejects_bad_thresholds() {
        let mut cfg = StrategyConfig::default();
        cfg.threshold_2 = cfg.threshold_1;
        assert!(cfg.validate().is_err());

        let mut cfg = StrategyConfig::default();
        cfg.threshold_1 = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = StrategyConfig::default();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = StrategyConfig::default();
        cfg.position_size_1 = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn risk_validation_bounds() {
        RiskConfig::default().validate().unwrap();

        let mut cfg = RiskConfig::default();
        cfg.max_daily_loss = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = RiskConfig::default();
        cfg.max_drawdown = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.strategy.symbols, vec!["IM0", "IC0"]);
        assert_eq!(cfg.risk.max_daily_loss, 10_000.0);
        assert_eq!(cfg.poll_interval_secs, 60);
        assert_eq!(cfg.notify.channels, vec!["telegram"]);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "strategy": { "symbols": ["IF0"], "threshold_1": 0.015 } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.strategy.symbols, vec!["IF0"]);
        assert_eq!(cfg.strategy.threshold_1, 0.015);
        assert_eq!(cfg.strategy.threshold_2, 0.02);
        assert!(cfg.risk.force_close_on_limit);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.strategy.symbols, cfg2.strategy.symbols);
        assert_eq!(cfg.strategy.watch_start, cfg2.strategy.watch_start);
        assert_eq!(cfg.risk.max_total_position, cfg2.risk.max_total_position);
    }

    #[test]
    fn normalized_symbols_expand_shorthand() {
        let cfg = StrategyConfig {
            symbols: vec!["im".into(), "IC2503".into()],
            ..StrategyConfig::default()
        };
        assert_eq!(cfg.normalized_symbols(), vec!["IM0", "IC2503"]);
    }
}
