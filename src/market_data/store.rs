// =============================================================================
// BarStore — daily minute-bar snapshots on disk
// =============================================================================
//
// One CSV file per (product, date) at `<data_dir>/<PRODUCT>/<YYYY-MM-DD>.csv`
// with columns: datetime, open, high, low, close, volume, amount.
//
// The store is a cache tier, not a system of record: the in-memory handler
// cache stays authoritative and persistence failures are logged by callers
// without retry.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::MinuteBar;
use crate::types::product_of;

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// On-disk row shape. The symbol is implied by the directory.
#[derive(Debug, Serialize, Deserialize)]
struct BarRow {
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    amount: f64,
}

pub struct BarStore {
    data_dir: PathBuf,
}

impl BarStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        if let Err(e) = std::fs::create_dir_all(&data_dir) {
            warn!(dir = %data_dir.display(), error = %e, "failed to create data directory");
        }
        Self { data_dir }
    }

    fn day_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(product_of(symbol))
            .join(format!("{date}.csv"))
    }

    /// Persist the bars of `symbol` that fall on `date`. Returns the number
    /// of rows written (zero rows writes nothing).
    pub fn save_day(&self, symbol: &str, date: NaiveDate, bars: &[MinuteBar]) -> Result<usize> {
        let day_bars: Vec<&MinuteBar> = bars.iter().filter(|b| b.date() == date).collect();
        if day_bars.is_empty() {
            return Ok(0);
        }

        let path = self.day_path(symbol, date);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;

        for bar in &day_bars {
            writer
                .serialize(BarRow {
                    datetime: bar.timestamp.format(TIMESTAMP_FMT).to_string(),
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    amount: bar.amount,
                })
                .context("failed to serialise bar row")?;
        }
        writer.flush().context("failed to flush snapshot")?;

        info!(path = %path.display(), rows = day_bars.len(), "snapshot saved");
        Ok(day_bars.len())
    }

    /// Load the snapshot for `(symbol, date)`. `Ok(None)` when no file exists.
    pub fn load_day(&self, symbol: &str, date: NaiveDate) -> Result<Option<Vec<MinuteBar>>> {
        let path = self.day_path(symbol, date);
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut bars = Vec::new();
        for row in reader.deserialize::<BarRow>() {
            let row = row.with_context(|| format!("bad row in {}", path.display()))?;
            let timestamp = NaiveDateTime::parse_from_str(&row.datetime, TIMESTAMP_FMT)
                .with_context(|| format!("bad timestamp in {}", path.display()))?;
            bars.push(MinuteBar {
                symbol: symbol.to_string(),
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                amount: row.amount,
            });
        }
        bars.sort_by_key(|b| b.timestamp);

        info!(path = %path.display(), rows = bars.len(), "snapshot loaded");
        Ok(Some(bars))
    }

    /// Remove snapshot files dated before `cutoff`. Files whose names do not
    /// parse as dates are left alone. Returns the number removed.
    pub fn cleanup_before(&self, cutoff: NaiveDate) -> usize {
        let mut removed = 0;

        let Ok(products) = std::fs::read_dir(&self.data_dir) else {
            return 0;
        };

        for product in products.flatten() {
            if !product.path().is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(product.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if !file_is_old_snapshot(&path, cutoff) {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
                }
            }
        }

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "old snapshots cleaned up");
        }
        removed
    }
}

fn file_is_old_snapshot(path: &Path, cutoff: NaiveDate) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    if path.extension().and_then(|e| e.to_str()) != Some("csv") {
        return false;
    }
    match NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
        Ok(date) => date < cutoff,
        Err(_) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn temp_store() -> BarStore {
        let dir = std::env::temp_dir().join(format!("cffex-settle-store-{}", uuid::Uuid::new_v4()));
        BarStore::new(dir)
    }

    fn bar(ts: &str, close: f64) -> MinuteBar {
        MinuteBar {
            symbol: "IM0".into(),
            timestamp: NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 12.0,
            amount: 0.0,
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let store = temp_store();
        let date = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();
        let bars = vec![
            bar("2026-02-09 14:30:00", 5900.0),
            bar("2026-02-09 14:31:00", 5895.5),
            // Different day — filtered out of the snapshot.
            bar("2026-02-10 09:30:00", 5880.0),
        ];

        let written = store.save_day("IM0", date, &bars).unwrap();
        assert_eq!(written, 2);

        let loaded = store.load_day("IM0", date).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], bars[0]);
        assert_eq!(loaded[1], bars[1]);
    }

    #[test]
    fn load_missing_returns_none() {
        let store = temp_store();
        let date = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();
        assert!(store.load_day("IC0", date).unwrap().is_none());
    }

    #[test]
    fn cleanup_removes_only_dated_files_before_cutoff() {
        let store = temp_store();
        let old = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let recent = NaiveDate::from_ymd_opt(2026, 2, 9).unwrap();

        store
            .save_day("IM0", old, &[bar("2026-01-02 14:30:00", 5800.0)])
            .unwrap();
        store
            .save_day("IM0", recent, &[bar("2026-02-09 14:30:00", 5900.0)])
            .unwrap();

        // A stray non-snapshot file must survive cleanup.
        let stray = store.data_dir.join("IM").join("notes.txt");
        std::fs::write(&stray, "keep me").unwrap();

        let cutoff = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let removed = store.cleanup_before(cutoff);

        assert_eq!(removed, 1);
        assert!(store.load_day("IM0", old).unwrap().is_none());
        assert!(store.load_day("IM0", recent).unwrap().is_some());
        assert!(stray.exists());
    }
}
