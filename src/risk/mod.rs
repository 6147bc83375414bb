//! Risk controller - position sizing and admission control
//!
//! Implements:
//! - Rise-day / cumulative-rise / position-count scaled sizing
//! - Ordered admission gate (first failure wins)
//! - Daily statistics with date rollover
//! - Circuit breaker (daily loss limit, loss streak, pre-close window)
//! - Advisory risk scoring

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RiskConfig;
use crate::types::{OrderSide, SellReason};

/// Coarse risk classification of a candidate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
        }
    }
}

/// Ephemeral result of sizing one candidate entry.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub day_ratio: f64,
    pub rise_ratio: f64,
    pub position_ratio: f64,
    pub final_ratio: f64,
    pub final_amount: f64,
    pub risk_level: RiskLevel,
    pub allowed: bool,
    pub reason: String,
}

/// Realized statistics for one trading day; reset when the date advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRiskStats {
    pub date: NaiveDate,
    /// Net realized P/L (losses included as negatives).
    pub total_profit: f64,
    /// Absolute sum of losing trades.
    pub total_loss: f64,
    pub trade_count: u32,
    pub buy_count: u32,
    pub sell_count: u32,
}

impl DailyRiskStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_profit: 0.0,
            total_loss: 0.0,
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
        }
    }
}

/// One entry of the bounded trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub side: OrderSide,
    pub symbol: String,
    pub amount: f64,
    pub profit: f64,
    #[serde(default)]
    pub reason: Option<SellReason>,
}

/// Summary of the recent closed trades, for operator display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskStatistics {
    pub total_trades: usize,
    pub win_rate_pct: f64,
    pub avg_profit: f64,
    pub max_loss: f64,
    pub max_profit: f64,
    pub total_profit: f64,
}

/// Sizes entries, gates admission and accumulates realized trade stats.
pub struct RiskController {
    config: RiskConfig,
    daily_stats: DailyRiskStats,
    trade_history: Vec<TradeRecord>,
}

impl RiskController {
    pub fn new(config: RiskConfig, today: NaiveDate) -> Self {
        Self {
            config,
            daily_stats: DailyRiskStats::new(today),
            trade_history: Vec::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: RiskConfig) {
        self.config = config;
    }

    /// Convert episode shape and portfolio load into a sized, gated entry.
    pub fn size_position(
        &mut self,
        base_amount: f64,
        rise_days: u32,
        cumulative_rise_pct: f64,
        open_position_count: usize,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        self.roll_daily_stats(now.date_naive());

        let day_ratio = self.day_ratio(rise_days);
        let rise_ratio = self.rise_ratio(cumulative_rise_pct);
        let position_ratio = Self::position_ratio(open_position_count);
        let final_ratio = day_ratio * rise_ratio * position_ratio;
        let final_amount = (base_amount * final_ratio).floor();
        let risk_level = Self::risk_level(rise_days, cumulative_rise_pct, final_ratio);
        let (allowed, reason) =
            self.check_entry_allowed(rise_days, final_amount, open_position_count);

        debug!(
            rise_days,
            cumulative_rise_pct,
            open_position_count,
            final_ratio,
            final_amount,
            allowed,
            %reason,
            "position sizing"
        );

        RiskAssessment {
            day_ratio,
            rise_ratio,
            position_ratio,
            final_ratio,
            final_amount,
            risk_level,
            allowed,
            reason,
        }
    }

    /// Scaling by consecutive rise days; first matching bound (ascending) wins.
    pub fn day_ratio(&self, rise_days: u32) -> f64 {
        let mut steps = self.config.day_ratio_table.clone();
        steps.sort_by_key(|s| s.max_days);
        for step in &steps {
            if rise_days <= step.max_days {
                return step.ratio;
            }
        }
        0.0
    }

    /// Scaling by cumulative rise; strict less-than bounds, ascending. Beyond
    /// the table the smallest configured ratio applies.
    pub fn rise_ratio(&self, cumulative_rise_pct: f64) -> f64 {
        let mut steps = self.config.rise_ratio_table.clone();
        steps.sort_by(|a, b| a.max_pct.total_cmp(&b.max_pct));
        for step in &steps {
            if cumulative_rise_pct < step.max_pct {
                return step.ratio;
            }
        }
        steps
            .iter()
            .map(|s| s.ratio)
            .fold(f64::MAX, f64::min)
            .min(1.0)
    }

    /// Scaling by how many symbols are already held.
    pub fn position_ratio(open_position_count: usize) -> f64 {
        if open_position_count >= 8 {
            0.5
        } else if open_position_count >= 5 {
            0.7
        } else if open_position_count >= 3 {
            0.9
        } else {
            1.0
        }
    }

    fn risk_level(rise_days: u32, cumulative_rise_pct: f64, final_ratio: f64) -> RiskLevel {
        if rise_days >= 5 || cumulative_rise_pct >= 100.0 || final_ratio <= 0.3 {
            RiskLevel::High
        } else if rise_days >= 3 || cumulative_rise_pct >= 70.0 || final_ratio <= 0.6 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// The admission gate, evaluated in fixed order; the first failure wins.
    fn check_entry_allowed(
        &self,
        rise_days: u32,
        amount: f64,
        open_position_count: usize,
    ) -> (bool, String) {
        if rise_days >= 5 {
            return (false, format!("rise-day limit reached ({rise_days} days)"));
        }
        if open_position_count >= self.config.max_position_stocks {
            return (
                false,
                format!(
                    "position limit reached ({open_position_count}/{})",
                    self.config.max_position_stocks
                ),
            );
        }
        if amount > self.config.max_single_position {
            return (
                false,
                format!(
                    "single-position cap exceeded ({amount:.0}/{:.0})",
                    self.config.max_single_position
                ),
            );
        }
        if self.daily_stats.total_profit <= self.config.daily_loss_limit {
            return (
                false,
                format!(
                    "daily loss limit reached ({:.0}/{:.0})",
                    self.daily_stats.total_profit, self.config.daily_loss_limit
                ),
            );
        }
        if amount < self.config.min_order_amount {
            return (
                false,
                format!(
                    "below minimum order amount ({amount:.0}/{:.0})",
                    self.config.min_order_amount
                ),
            );
        }
        (true, "entry allowed".to_string())
    }

    /// Circuit breaker, evaluated independently of per-entry admission.
    pub fn should_stop_trading(&mut self, now: DateTime<Utc>) -> Option<String> {
        self.roll_daily_stats(now.date_naive());

        if self.daily_stats.total_profit <= self.config.daily_loss_limit {
            return Some(format!(
                "daily loss limit reached ({:.0})",
                self.daily_stats.total_profit
            ));
        }

        let recent: Vec<&TradeRecord> = self
            .trade_history
            .iter()
            .rev()
            .filter(|t| t.side == OrderSide::Sell)
            .take(5)
            .collect();
        if recent.len() >= 3 {
            let losses = recent.iter().filter(|t| t.profit < 0.0).count();
            if losses >= 3 {
                return Some(format!("loss streak ({losses} of last {})", recent.len()));
            }
        }

        let time = now.time();
        let halt_from = (self.config.halt_hour, self.config.halt_minute);
        if (time.hour(), time.minute()) >= halt_from {
            return Some("inside pre-close halt window".to_string());
        }

        None
    }

    /// Advisory 0-100 risk score; never gates admission.
    pub fn risk_score(
        &self,
        rise_days: u32,
        cumulative_rise_pct: f64,
        open_position_count: usize,
    ) -> u32 {
        let mut score = (rise_days as f64 * 8.0).min(40.0);

        score += if cumulative_rise_pct >= 100.0 {
            30.0
        } else if cumulative_rise_pct >= 70.0 {
            20.0
        } else if cumulative_rise_pct >= 50.0 {
            10.0
        } else {
            0.0
        };

        score += (open_position_count as f64 * 2.0).min(20.0);

        if self.daily_stats.total_profit < 0.0 && self.config.daily_loss_limit != 0.0 {
            let loss_ratio = (self.daily_stats.total_profit / self.config.daily_loss_limit).abs();
            score += (loss_ratio * 10.0).min(10.0);
        }

        score.min(100.0) as u32
    }

    /// Record one executed trade into the history and the daily stats.
    pub fn record_trade(
        &mut self,
        side: OrderSide,
        symbol: &str,
        amount: f64,
        profit: f64,
        reason: Option<SellReason>,
        now: DateTime<Utc>,
    ) {
        let today = now.date_naive();
        self.roll_daily_stats(today);

        self.trade_history.push(TradeRecord {
            timestamp: now,
            date: today,
            side,
            symbol: symbol.to_string(),
            amount,
            profit,
            reason,
        });

        self.daily_stats.trade_count += 1;
        match side {
            OrderSide::Buy => self.daily_stats.buy_count += 1,
            OrderSide::Sell => {
                self.daily_stats.sell_count += 1;
                self.daily_stats.total_profit += profit;
                if profit < 0.0 {
                    self.daily_stats.total_loss += profit.abs();
                }
            }
        }

        debug!(
            %side,
            symbol,
            amount,
            profit,
            "trade recorded"
        );
    }

    fn roll_daily_stats(&mut self, today: NaiveDate) {
        if self.daily_stats.date != today {
            info!(from = %self.daily_stats.date, to = %today, "daily stats rollover");
            self.daily_stats = DailyRiskStats::new(today);
        }
    }

    /// Drop trade records older than the configured retention.
    pub fn cleanup_old_trades(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now.date_naive() - chrono::Duration::days(self.config.history_retention_days);
        let before = self.trade_history.len();
        self.trade_history.retain(|t| t.date >= cutoff);
        before - self.trade_history.len()
    }

    /// Statistics over the most recent closed trades (display only).
    pub fn risk_statistics(&self) -> RiskStatistics {
        let sells: Vec<&TradeRecord> = self
            .trade_history
            .iter()
            .rev()
            .filter(|t| t.side == OrderSide::Sell)
            .take(20)
            .collect();
        if sells.is_empty() {
            return RiskStatistics::default();
        }
        let profits: Vec<f64> = sells.iter().map(|t| t.profit).collect();
        let wins = profits.iter().filter(|p| **p > 0.0).count();
        RiskStatistics {
            total_trades: sells.len(),
            win_rate_pct: wins as f64 / sells.len() as f64 * 100.0,
            avg_profit: profits.iter().sum::<f64>() / profits.len() as f64,
            max_loss: profits.iter().copied().fold(f64::MAX, f64::min).min(0.0),
            max_profit: profits.iter().copied().fold(f64::MIN, f64::max).max(0.0),
            total_profit: profits.iter().sum(),
        }
    }

    pub fn daily_stats(&self) -> &DailyRiskStats {
        &self.daily_stats
    }

    /// Bounded tail of the trade history for persistence.
    pub fn history_tail(&self, max: usize) -> Vec<TradeRecord> {
        let skip = self.trade_history.len().saturating_sub(max);
        self.trade_history[skip..].to_vec()
    }

    /// Restore persisted state. Daily stats only survive a restart within
    /// the same calendar day.
    pub fn restore(
        &mut self,
        daily_stats: Option<DailyRiskStats>,
        history: Vec<TradeRecord>,
        today: NaiveDate,
    ) {
        if let Some(stats) = daily_stats {
            if stats.date == today {
                self.daily_stats = stats;
            }
        }
        self.trade_history = history;
    }
}
