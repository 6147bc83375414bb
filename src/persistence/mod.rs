//! Snapshot persistence
//!
//! JSON snapshots for tracking, risk and rebuy-restriction state, plus a
//! CSV log of closed trades. Missing files are an empty initial state; a
//! corrupt per-symbol record is skipped with a warning and the rest of the
//! file still loads.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{DayRatioStep, RiseRatioStep};
use crate::engine::rebuy::RestrictionRecord;
use crate::ledger::Position;
use crate::risk::{DailyRiskStats, TradeRecord};
use crate::tracker::TrackingCandidate;
use crate::types::ClosedTrade;

const TRACKING_FILE: &str = "tracking.json";
const POSITIONS_FILE: &str = "positions.json";
const RISK_FILE: &str = "risk.json";
const REBUY_FILE: &str = "rebuy.json";
const TRADES_CSV: &str = "trades.csv";

/// How many trade records the risk snapshot keeps.
pub const RISK_HISTORY_TAIL: usize = 100;

/// The risk settings block mirrored into the risk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettingsSnapshot {
    pub daily_loss_limit: f64,
    pub max_tracking_stocks: usize,
    pub max_position_stocks: usize,
    pub max_single_position: f64,
    pub day_ratio_table: Vec<DayRatioStep>,
    pub rise_ratio_table: Vec<RiseRatioStep>,
}

/// Persisted risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub settings: RiskSettingsSnapshot,
    pub daily_stats: Option<DailyRiskStats>,
    pub trade_history: Vec<TradeRecord>,
}

/// File-backed store for every snapshot the engine owns.
pub struct SnapshotStore {
    data_dir: PathBuf,
    csv_enabled: bool,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>, csv_enabled: bool) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            csv_enabled,
        })
    }

    // ── Tracking ────────────────────────────────────────────────

    pub fn load_tracking(&self) -> HashMap<String, TrackingCandidate> {
        load_keyed_map(&self.data_dir.join(TRACKING_FILE), "tracking")
    }

    pub fn save_tracking(&self, snapshot: &HashMap<String, TrackingCandidate>) -> Result<()> {
        write_json(&self.data_dir.join(TRACKING_FILE), snapshot)
    }

    // ── Positions ───────────────────────────────────────────────

    pub fn load_positions(&self) -> HashMap<String, Position> {
        load_keyed_map(&self.data_dir.join(POSITIONS_FILE), "positions")
    }

    pub fn save_positions(&self, snapshot: &HashMap<String, Position>) -> Result<()> {
        write_json(&self.data_dir.join(POSITIONS_FILE), snapshot)
    }

    // ── Risk ────────────────────────────────────────────────────

    pub fn load_risk(&self) -> Option<RiskSnapshot> {
        let path = self.data_dir.join(RISK_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                info!("no risk snapshot, starting empty");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt risk snapshot, starting empty");
                None
            }
        }
    }

    pub fn save_risk(&self, snapshot: &RiskSnapshot) -> Result<()> {
        write_json(&self.data_dir.join(RISK_FILE), snapshot)
    }

    // ── Rebuy restrictions ──────────────────────────────────────

    pub fn load_rebuy(&self) -> HashMap<String, RestrictionRecord> {
        load_keyed_map(&self.data_dir.join(REBUY_FILE), "rebuy")
    }

    pub fn save_rebuy(&self, snapshot: &HashMap<String, RestrictionRecord>) -> Result<()> {
        write_json(&self.data_dir.join(REBUY_FILE), snapshot)
    }

    // ── Closed-trade CSV log ────────────────────────────────────

    pub fn append_closed_trade(&self, trade: &ClosedTrade) -> Result<()> {
        if !self.csv_enabled {
            return Ok(());
        }
        let path = self.data_dir.join(TRADES_CSV);
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        writer
            .serialize(trade)
            .context("serializing closed trade")?;
        writer.flush().context("flushing trade log")?;
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing snapshot")?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Load a symbol-keyed JSON map, skipping entries that fail to decode so
/// one corrupt record never takes out the rest.
fn load_keyed_map<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> HashMap<String, T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!(what, "no snapshot file, starting empty");
            return HashMap::new();
        }
    };
    let entries: HashMap<String, serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(what, path = %path.display(), error = %err, "unreadable snapshot, starting empty");
            return HashMap::new();
        }
    };

    let mut out = HashMap::new();
    for (symbol, value) in entries {
        match serde_json::from_value(value) {
            Ok(record) => {
                out.insert(symbol, record);
            }
            Err(err) => {
                warn!(what, symbol, error = %err, "skipping corrupt snapshot record");
            }
        }
    }
    info!(what, count = out.len(), "snapshot loaded");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{RiseMatrix, RiseMatrixRow};
    use chrono::TimeZone;

    fn temp_store(name: &str) -> SnapshotStore {
        let dir = std::env::temp_dir().join(format!(
            "dipbot-persistence-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        SnapshotStore::new(dir, true).unwrap()
    }

    fn candidate() -> TrackingCandidate {
        let matrix = RiseMatrix::new(vec![RiseMatrixRow {
            rise_min: 0.0,
            rise_max: 999.0,
            drop_min: 5.0,
            drop_max: 12.0,
        }])
        .unwrap();
        let now = chrono::Utc.with_ymd_and_hms(2025, 9, 8, 1, 0, 0).unwrap();
        TrackingCandidate::new("005930", 10_000.0, &matrix, now)
    }

    #[test]
    fn missing_files_load_as_empty_state() {
        let store = temp_store("missing");
        assert!(store.load_tracking().is_empty());
        assert!(store.load_positions().is_empty());
        assert!(store.load_rebuy().is_empty());
        assert!(store.load_risk().is_none());
    }

    #[test]
    fn tracking_snapshot_round_trips() {
        let store = temp_store("roundtrip");
        let mut snapshot = HashMap::new();
        snapshot.insert("005930".to_string(), candidate());
        store.save_tracking(&snapshot).unwrap();

        let loaded = store.load_tracking();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["005930"].start_price, 10_000.0);
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let store = temp_store("corrupt");
        let mut snapshot = HashMap::new();
        snapshot.insert("GOOD".to_string(), candidate());
        store.save_tracking(&snapshot).unwrap();

        // Splice a malformed record in beside the good one
        let path = store.data_dir.join(TRACKING_FILE);
        let raw = fs::read_to_string(&path).unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["BAD"] = serde_json::json!({"start_price": "not a number"});
        fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let loaded = store.load_tracking();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("GOOD"));
    }

    #[test]
    fn closed_trades_append_with_single_header() {
        let store = temp_store("csv");
        let trade = ClosedTrade {
            symbol: "005930".to_string(),
            quantity: 10,
            avg_buy_price: 10_000.0,
            sell_price: 10_500.0,
            profit_amount: 5_000.0,
            profit_rate_pct: 5.0,
            reason: crate::types::SellReason::TrailingSell,
            closed_at: chrono::Utc.with_ymd_and_hms(2025, 9, 8, 5, 0, 0).unwrap(),
        };
        store.append_closed_trade(&trade).unwrap();
        store.append_closed_trade(&trade).unwrap();

        let raw = fs::read_to_string(store.data_dir.join(TRADES_CSV)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3, "one header plus two records: {raw}");
        assert!(lines[0].contains("symbol"));
    }
}
