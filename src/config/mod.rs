//! Configuration management for DipBot
//!
//! Loads from layered config files + environment variables via .env, with
//! built-in defaults for every recognized option.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::matrix::{default_rows, RiseMatrix, RiseMatrixRow};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub tracking: TrackingConfig,
    pub support: SupportConfig,
    pub risk: RiskConfig,
    pub position: PositionConfig,
    pub entry: EntryConfig,
    pub persistence: PersistenceConfig,
    /// Ordered rise→pullback rows; defaults to the built-in table.
    #[serde(default = "default_rows")]
    pub rise_matrix: Vec<RiseMatrixRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging
    pub tag: String,
    /// Dry run mode (intents are logged, not forwarded)
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Day-change percentage that flags a symbol as a rise candidate
    pub rise_threshold_pct: f64,
    /// Maximum symbols tracked at once
    pub max_tracking_stocks: usize,
    /// Episode expires after this many rise days without reaching tier 1
    pub max_rise_days: u32,
    /// Consecutive non-new-high days before WAITING is forced to READY
    pub max_waiting_days: u32,
    /// Tracked price bounds
    pub min_price: f64,
    pub max_price: f64,
    /// Age-based sweep: drop candidates idle for this many days
    pub cleanup_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportConfig {
    /// Oscillator averaging period
    pub rsi_period: usize,
    /// Oversold at or below this value
    pub rsi_threshold: f64,
    /// Volume is "dried" at or below this fraction of the episode maximum
    pub volume_ratio_threshold: f64,
    /// A support level within this percentage of price counts as near
    pub support_tolerance_pct: f64,
    /// Bars on each side when hunting local minima
    pub support_lookback: usize,
    /// Minimum bounce off a low for it to count as support, percent
    pub bounce_min_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Daily realized P/L floor; at or below this the breaker trips (negative)
    pub daily_loss_limit: f64,
    /// Maximum simultaneously held symbols
    pub max_position_stocks: usize,
    /// Maximum amount committed to one symbol
    pub max_single_position: f64,
    /// Orders below this amount are rejected
    pub min_order_amount: f64,
    /// Pre-sizing base amount per entry
    pub base_buy_amount: f64,
    /// Trading halts at this local hour (pre-close window)
    pub halt_hour: u32,
    pub halt_minute: u32,
    /// Position scaling by consecutive rise days, first matching bound wins
    #[serde(default = "default_day_ratio_table")]
    pub day_ratio_table: Vec<DayRatioStep>,
    /// Position scaling by cumulative rise, strict less-than bounds
    #[serde(default = "default_rise_ratio_table")]
    pub rise_ratio_table: Vec<RiseRatioStep>,
    /// Trade-history retention in days
    pub history_retention_days: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DayRatioStep {
    pub max_days: u32,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiseRatioStep {
    pub max_pct: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionConfig {
    /// Cost-basis stop for positions with no episode anchor (negative pct)
    pub stop_loss_pct: f64,
    /// Profit percentage that arms the trailing stop
    pub trailing_trigger_pct: f64,
    /// Retrace from the trailing high that fires the sell (sign ignored)
    pub trailing_sell_pct: f64,
    /// Window during which a duplicate sell intent is suppressed
    pub sell_dedup_secs: i64,
    /// Age-based sweep: flag positions idle for this many days
    pub cleanup_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Support signals required per tier; deeper tiers demand more
    pub conditions_tier1: f64,
    pub conditions_tier2: f64,
    pub conditions_tier3: f64,
    /// Cool-down after a sell before the symbol may be re-tracked
    pub rebuy_restriction_days: i64,
}

impl EntryConfig {
    pub fn required_for(&self, tier: crate::types::BuyTier) -> f64 {
        match tier {
            crate::types::BuyTier::First => self.conditions_tier1,
            crate::types::BuyTier::Second => self.conditions_tier2,
            crate::types::BuyTier::Third => self.conditions_tier3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for snapshots and the trade log
    pub data_dir: String,
    /// Enable the CSV closed-trade log
    pub csv_enabled: bool,
}

fn default_day_ratio_table() -> Vec<DayRatioStep> {
    vec![
        DayRatioStep { max_days: 1, ratio: 1.0 },
        DayRatioStep { max_days: 2, ratio: 1.0 },
        DayRatioStep { max_days: 3, ratio: 0.8 },
        DayRatioStep { max_days: 4, ratio: 0.5 },
        DayRatioStep { max_days: 5, ratio: 0.0 },
    ]
}

fn default_rise_ratio_table() -> Vec<RiseRatioStep> {
    vec![
        RiseRatioStep { max_pct: 50.0, ratio: 1.0 },
        RiseRatioStep { max_pct: 70.0, ratio: 0.8 },
        RiseRatioStep { max_pct: 100.0, ratio: 0.5 },
        RiseRatioStep { max_pct: 999.0, ratio: 0.3 },
    ]
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.dry_run", true)?
            // Tracking defaults
            .set_default("tracking.rise_threshold_pct", 20.0)?
            .set_default("tracking.max_tracking_stocks", 20)?
            .set_default("tracking.max_rise_days", 7)?
            .set_default("tracking.max_waiting_days", 3)?
            .set_default("tracking.min_price", 1_000.0)?
            .set_default("tracking.max_price", 100_000.0)?
            .set_default("tracking.cleanup_days", 7)?
            // Support defaults
            .set_default("support.rsi_period", 14)?
            .set_default("support.rsi_threshold", 30.0)?
            .set_default("support.volume_ratio_threshold", 0.25)?
            .set_default("support.support_tolerance_pct", 1.0)?
            .set_default("support.support_lookback", 20)?
            .set_default("support.bounce_min_pct", 2.0)?
            // Risk defaults
            .set_default("risk.daily_loss_limit", -200_000.0)?
            .set_default("risk.max_position_stocks", 30)?
            .set_default("risk.max_single_position", 500_000.0)?
            .set_default("risk.min_order_amount", 50_000.0)?
            .set_default("risk.base_buy_amount", 200_000.0)?
            .set_default("risk.halt_hour", 15)?
            .set_default("risk.halt_minute", 0)?
            .set_default("risk.history_retention_days", 30)?
            // Position defaults
            .set_default("position.stop_loss_pct", -2.0)?
            .set_default("position.trailing_trigger_pct", 2.0)?
            .set_default("position.trailing_sell_pct", -1.0)?
            .set_default("position.sell_dedup_secs", 30)?
            .set_default("position.cleanup_days", 30)?
            // Entry defaults
            .set_default("entry.conditions_tier1", 1.0)?
            .set_default("entry.conditions_tier2", 2.0)?
            .set_default("entry.conditions_tier3", 2.0)?
            .set_default("entry.rebuy_restriction_days", 5)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (DIPBOT_*)
            .add_source(Environment::with_prefix("DIPBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Build the validated rise matrix from the configured rows.
    pub fn rise_matrix(&self) -> Result<RiseMatrix> {
        Ok(RiseMatrix::new(self.rise_matrix.clone())?)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "tag={} dry_run={} rise_threshold={:.1}% max_tracking={} base_amount={:.0}",
            self.bot.tag,
            self.bot.dry_run,
            self.tracking.rise_threshold_pct,
            self.tracking.max_tracking_stocks,
            self.risk.base_buy_amount
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_files() {
        let cfg = AppConfig::load().expect("defaults should satisfy the schema");
        assert_eq!(cfg.tracking.max_rise_days, 7);
        assert_eq!(cfg.tracking.max_waiting_days, 3);
        assert!((cfg.position.trailing_trigger_pct - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.entry.rebuy_restriction_days, 5);
        assert!(cfg.rise_matrix().is_ok());
    }

    #[test]
    fn default_ratio_tables_match_policy() {
        let cfg = AppConfig::load().unwrap();
        assert_eq!(cfg.risk.day_ratio_table.len(), 5);
        assert!((cfg.risk.day_ratio_table[2].ratio - 0.8).abs() < f64::EPSILON);
        assert!((cfg.risk.rise_ratio_table[3].ratio - 0.3).abs() < f64::EPSILON);
    }
}
