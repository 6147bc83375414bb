//! Position ledger - per-symbol open-position state machine
//!
//! Owns tiered fills, the weighted average cost, the trailing-stop
//! sub-state and the exit-signal evaluation. Sell-intent idempotency and
//! the single-shot stop-loss are explicit sub-states rather than loose
//! boolean flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::PositionConfig;
use crate::types::{BuyTier, ClosedTrade, SellReason};

/// Position lifecycle. Trailing is a sub-mode of holding; a stop-loss can
/// still fire while it is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Holding,
    Trailing,
    Sold,
}

/// The stop-loss is armed exactly once per position and never re-arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopLossState {
    Armed,
    Fired,
}

/// Trailing-stop sub-state; the high is monotone while active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailingStop {
    Inactive,
    Active { high: f64 },
}

/// At most one sell intent may be in flight per symbol. A pending entry
/// past the dedup window is treated as lost and cleared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExitInFlight {
    Idle,
    Pending {
        since: DateTime<Utc>,
        reason: SellReason,
    },
}

/// One tiered buy fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub tier: BuyTier,
    pub price: f64,
    pub quantity: u32,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the owning rise episode, captured at fill time so the
/// stop-loss stays evaluable after the tracker entry completes. The
/// stop-loss measures pullback from the episode anchor, never from the
/// weighted average cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpisodeAnchor {
    pub start_price: f64,
    pub high_price: f64,
    pub stop_loss_pct: f64,
}

impl EpisodeAnchor {
    /// Pullback from the episode high in rise-percentage units.
    pub fn drop_rate_pct(&self, current_price: f64) -> f64 {
        if self.start_price <= 0.0 {
            return 0.0;
        }
        let rise_high = (self.high_price - self.start_price) / self.start_price * 100.0;
        let rise_now = (current_price - self.start_price) / self.start_price * 100.0;
        (rise_high - rise_now).max(0.0)
    }
}

/// One open holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub fills: Vec<Fill>,
    pub total_quantity: u32,
    pub weighted_avg_price: f64,
    pub current_price: f64,
    pub profit_rate_pct: f64,
    pub status: PositionStatus,
    pub trailing: TrailingStop,
    pub stop_loss: StopLossState,
    pub exit_in_flight: ExitInFlight,
    #[serde(default)]
    pub anchor: Option<EpisodeAnchor>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Position {
    fn new(symbol: &str, now: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            fills: Vec::new(),
            total_quantity: 0,
            weighted_avg_price: 0.0,
            current_price: 0.0,
            profit_rate_pct: 0.0,
            status: PositionStatus::Holding,
            trailing: TrailingStop::Inactive,
            stop_loss: StopLossState::Armed,
            exit_in_flight: ExitInFlight::Idle,
            anchor: None,
            created_at: now,
            last_update: now,
        }
    }

    /// `Σ(price·qty)/Σqty` over all fills; fill order never matters.
    fn recompute_weighted_avg(&mut self) {
        let total_qty: u64 = self.fills.iter().map(|f| f.quantity as u64).sum();
        if total_qty == 0 {
            self.weighted_avg_price = 0.0;
            return;
        }
        let notional: f64 = self
            .fills
            .iter()
            .map(|f| f.price * f.quantity as f64)
            .sum();
        self.weighted_avg_price = notional / total_qty as f64;
    }

    pub fn filled_tiers(&self) -> Vec<BuyTier> {
        let mut tiers: Vec<BuyTier> = self.fills.iter().map(|f| f.tier).collect();
        tiers.sort();
        tiers.dedup();
        tiers
    }

    pub fn trailing_active(&self) -> bool {
        matches!(self.trailing, TrailingStop::Active { .. })
    }
}

/// Aggregate view for the operator surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStatistics {
    pub total_positions: usize,
    pub trailing_positions: usize,
    pub profitable_positions: usize,
    pub losing_positions: usize,
    pub total_profit_amount: f64,
}

/// Owned store of all open positions; every mutation funnels through here.
pub struct PositionLedger {
    positions: HashMap<String, Position>,
    config: PositionConfig,
}

impl PositionLedger {
    pub fn new(config: PositionConfig) -> Self {
        Self {
            positions: HashMap::new(),
            config,
        }
    }

    pub fn update_config(&mut self, config: PositionConfig) {
        self.config = config;
    }

    /// Append a buy fill, creating the position on the symbol's first fill.
    pub fn add_fill(
        &mut self,
        symbol: &str,
        tier: BuyTier,
        price: f64,
        quantity: u32,
        anchor: Option<EpisodeAnchor>,
        now: DateTime<Utc>,
    ) {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::new(symbol, now));

        position.fills.push(Fill {
            tier,
            price,
            quantity,
            timestamp: now,
        });
        position.total_quantity += quantity;
        position.recompute_weighted_avg();
        position.current_price = price;
        position.last_update = now;
        if anchor.is_some() {
            position.anchor = anchor;
        }

        info!(
            symbol,
            %tier,
            price,
            quantity,
            avg = position.weighted_avg_price,
            "fill recorded"
        );
    }

    /// Refresh the episode anchor while the tracker still owns the episode.
    pub fn refresh_anchor(&mut self, symbol: &str, anchor: EpisodeAnchor) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.anchor = Some(anchor);
        }
    }

    /// Fold a price update into the position and evaluate the exit signal.
    ///
    /// While a sell is in flight and inside the dedup window, trailing
    /// bookkeeping continues but no new signal is emitted; past the window
    /// the pending entry is treated as lost and evaluation resumes.
    pub fn update_price(
        &mut self,
        symbol: &str,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> Option<SellReason> {
        let dedup_secs = self.config.sell_dedup_secs;
        let trigger = self.config.trailing_trigger_pct;
        let sell_pct = self.config.trailing_sell_pct.abs();
        let fallback_stop_pct = self.config.stop_loss_pct;

        let position = self.positions.get_mut(symbol)?;
        position.current_price = current_price;
        position.last_update = now;
        if position.weighted_avg_price > 0.0 {
            position.profit_rate_pct = (current_price - position.weighted_avg_price)
                / position.weighted_avg_price
                * 100.0;
        }

        let suppressed = match position.exit_in_flight {
            ExitInFlight::Pending { since, reason } => {
                if (now - since).num_seconds() > dedup_secs {
                    warn!(
                        symbol,
                        ?reason,
                        "sell intent outlived the dedup window, treating as lost"
                    );
                    position.exit_in_flight = ExitInFlight::Idle;
                    false
                } else {
                    true
                }
            }
            ExitInFlight::Idle => false,
        };

        // Stop-loss outranks everything and fires at most once. With an
        // episode anchor the breach is measured as pullback from the
        // episode, never from cost; anchorless positions fall back to the
        // configured cost-basis stop.
        if !suppressed && position.stop_loss == StopLossState::Armed {
            let breached = match position.anchor {
                Some(anchor) => {
                    let drop = anchor.drop_rate_pct(current_price);
                    if drop > anchor.stop_loss_pct {
                        warn!(symbol, drop, stop = anchor.stop_loss_pct, "stop-loss fired");
                        true
                    } else {
                        false
                    }
                }
                None => {
                    if position.profit_rate_pct <= fallback_stop_pct {
                        warn!(
                            symbol,
                            profit = position.profit_rate_pct,
                            stop = fallback_stop_pct,
                            "cost-basis stop-loss fired"
                        );
                        true
                    } else {
                        false
                    }
                }
            };
            if breached {
                position.stop_loss = StopLossState::Fired;
                return Some(SellReason::StopLoss);
            }
        }

        // Trailing bookkeeping continues even while an intent is in flight.
        match position.trailing {
            TrailingStop::Inactive => {
                if position.profit_rate_pct >= trigger {
                    position.trailing = TrailingStop::Active {
                        high: current_price,
                    };
                    position.status = PositionStatus::Trailing;
                    info!(
                        symbol,
                        profit = position.profit_rate_pct,
                        "trailing stop armed"
                    );
                }
            }
            TrailingStop::Active { high } if current_price > high => {
                position.trailing = TrailingStop::Active {
                    high: current_price,
                };
            }
            TrailingStop::Active { .. } => {}
        }

        if suppressed {
            debug!(symbol, "sell already in flight, signal suppressed");
            return None;
        }

        if let TrailingStop::Active { high } = position.trailing {
            let retrace_pct = (high - current_price) / high * 100.0;
            if retrace_pct >= sell_pct {
                info!(
                    symbol,
                    high,
                    current_price,
                    retrace_pct,
                    "trailing sell fired"
                );
                return Some(SellReason::TrailingSell);
            }
        }

        None
    }

    /// Mark a sell intent in flight after it has been emitted.
    pub fn begin_sell(&mut self, symbol: &str, reason: SellReason, now: DateTime<Utc>) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.exit_in_flight = ExitInFlight::Pending { since: now, reason };
        }
    }

    /// Forget the in-flight marker (order rejected by the transport).
    pub fn clear_sell_in_flight(&mut self, symbol: &str) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.exit_in_flight = ExitInFlight::Idle;
        }
    }

    /// Confirmed sell fill: release the position and produce the realized
    /// trade record.
    pub fn close_on_sell_fill(
        &mut self,
        symbol: &str,
        sell_price: f64,
        now: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let mut position = self.positions.remove(symbol)?;
        position.status = PositionStatus::Sold;

        let reason = match position.exit_in_flight {
            ExitInFlight::Pending { reason, .. } => reason,
            ExitInFlight::Idle => SellReason::Manual,
        };
        let quantity = position.total_quantity;
        let profit_amount = (sell_price - position.weighted_avg_price) * quantity as f64;
        let profit_rate_pct = if position.weighted_avg_price > 0.0 {
            (sell_price - position.weighted_avg_price) / position.weighted_avg_price * 100.0
        } else {
            0.0
        };

        info!(
            symbol,
            quantity,
            sell_price,
            profit_amount,
            %reason,
            "position closed"
        );

        Some(ClosedTrade {
            symbol: symbol.to_string(),
            quantity,
            avg_buy_price: position.weighted_avg_price,
            sell_price,
            profit_amount,
            profit_rate_pct,
            reason,
            closed_at: now,
        })
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Evaluate every position against its current price; used by the
    /// periodic sweep as a safety net behind the tick path.
    pub fn check_all(&mut self, now: DateTime<Utc>) -> Vec<(String, SellReason)> {
        let symbols = self.symbols();
        let mut signals = Vec::new();
        for symbol in symbols {
            let price = match self.positions.get(&symbol) {
                Some(p) if p.current_price > 0.0 => p.current_price,
                _ => continue,
            };
            if let Some(reason) = self.update_price(&symbol, price, now) {
                signals.push((symbol, reason));
            }
        }
        signals
    }

    /// Positions with no update for the configured age, flagged for the
    /// operator. Advisory only; nothing is force-sold here.
    pub fn stale_positions(&self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - chrono::Duration::days(self.config.cleanup_days);
        self.positions
            .values()
            .filter(|p| p.last_update < cutoff)
            .map(|p| p.symbol.clone())
            .collect()
    }

    pub fn statistics(&self) -> LedgerStatistics {
        let mut stats = LedgerStatistics {
            total_positions: self.positions.len(),
            ..Default::default()
        };
        for p in self.positions.values() {
            if p.trailing_active() {
                stats.trailing_positions += 1;
            }
            if p.profit_rate_pct > 0.0 {
                stats.profitable_positions += 1;
            } else if p.profit_rate_pct < 0.0 {
                stats.losing_positions += 1;
            }
            stats.total_profit_amount +=
                (p.current_price - p.weighted_avg_price) * p.total_quantity as f64;
        }
        stats
    }

    pub fn snapshot(&self) -> HashMap<String, Position> {
        self.positions.clone()
    }

    pub fn restore(&mut self, positions: HashMap<String, Position>) {
        self.positions = positions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> PositionConfig {
        PositionConfig {
            stop_loss_pct: -2.0,
            trailing_trigger_pct: 2.0,
            trailing_sell_pct: -1.0,
            sell_dedup_secs: 30,
            cleanup_days: 30,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 8, 1, 0, 0).unwrap()
    }

    fn anchor() -> EpisodeAnchor {
        // 10,000 → 14,500 episode, stop at 15% pullback
        EpisodeAnchor {
            start_price: 10_000.0,
            high_price: 14_500.0,
            stop_loss_pct: 15.0,
        }
    }

    #[test]
    fn weighted_average_is_order_independent() {
        let fills = [
            (BuyTier::First, 13_000.0, 10),
            (BuyTier::Second, 12_500.0, 15),
            (BuyTier::Third, 12_000.0, 20),
        ];
        let expected: f64 = fills
            .iter()
            .map(|(_, p, q)| p * *q as f64)
            .sum::<f64>()
            / fills.iter().map(|(_, _, q)| *q as f64).sum::<f64>();

        let mut forward = PositionLedger::new(config());
        for (tier, price, qty) in fills {
            forward.add_fill("A", tier, price, qty, None, t0());
        }
        let mut reverse = PositionLedger::new(config());
        for (tier, price, qty) in fills.iter().rev() {
            reverse.add_fill("A", *tier, *price, *qty, None, t0());
        }

        assert!((forward.get("A").unwrap().weighted_avg_price - expected).abs() < 1e-9);
        assert!((reverse.get("A").unwrap().weighted_avg_price - expected).abs() < 1e-9);
        assert_eq!(forward.get("A").unwrap().total_quantity, 45);
    }

    #[test]
    fn first_fill_creates_position_in_holding() {
        let mut ledger = PositionLedger::new(config());
        assert!(!ledger.contains("A"));
        ledger.add_fill("A", BuyTier::First, 13_000.0, 10, Some(anchor()), t0());
        let p = ledger.get("A").unwrap();
        assert_eq!(p.status, PositionStatus::Holding);
        assert_eq!(p.stop_loss, StopLossState::Armed);
        assert_eq!(p.exit_in_flight, ExitInFlight::Idle);
        assert_eq!(p.filled_tiers(), vec![BuyTier::First]);
    }

    #[test]
    fn scenario_b_stop_loss_fires_exactly_once() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 13_600.0, 10, Some(anchor()), t0());

        // 45% − 29% = 16% pullback > 15% stop
        let signal = ledger.update_price("A", 12_900.0, t0());
        assert_eq!(signal, Some(SellReason::StopLoss));
        assert_eq!(ledger.get("A").unwrap().stop_loss, StopLossState::Fired);

        // Deeper breach, 17%: never fires again for this position
        let signal = ledger.update_price("A", 12_800.0, t0() + chrono::Duration::seconds(60));
        assert_eq!(signal, None);
    }

    #[test]
    fn stop_loss_measures_from_episode_anchor_not_cost() {
        let mut ledger = PositionLedger::new(config());
        // Bought deep at 12,900: cost basis barely under water at 12,800,
        // but the episode pullback is already past the stop line.
        ledger.add_fill("A", BuyTier::Third, 12_900.0, 10, Some(anchor()), t0());
        let signal = ledger.update_price("A", 12_800.0, t0());
        assert_eq!(signal, Some(SellReason::StopLoss));
        let p = ledger.get("A").unwrap();
        assert!(p.profit_rate_pct > -1.0, "cost-basis loss is small: {}", p.profit_rate_pct);
    }

    #[test]
    fn scenario_c_trailing_activates_tracks_and_fires() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());

        // +1% keeps trailing inactive and never fires a trailing sell
        assert_eq!(ledger.update_price("A", 10_100.0, t0()), None);
        assert!(!ledger.get("A").unwrap().trailing_active());

        // +2% arms it with the high at the current price
        assert_eq!(ledger.update_price("A", 10_200.0, t0()), None);
        let p = ledger.get("A").unwrap();
        assert_eq!(p.trailing, TrailingStop::Active { high: 10_200.0 });
        assert_eq!(p.status, PositionStatus::Trailing);

        // New high ratchets up
        assert_eq!(ledger.update_price("A", 10_400.0, t0()), None);
        assert_eq!(
            ledger.get("A").unwrap().trailing,
            TrailingStop::Active { high: 10_400.0 }
        );

        // Dip smaller than 1% off the high holds
        assert_eq!(ledger.update_price("A", 10_350.0, t0()), None);
        // More than 1% off the 10,400 high fires
        assert_eq!(
            ledger.update_price("A", 10_295.0, t0()),
            Some(SellReason::TrailingSell)
        );
    }

    #[test]
    fn anchorless_position_uses_cost_basis_stop() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());

        // -1.9% holds, -2% fires, and only once
        assert_eq!(ledger.update_price("A", 9_810.0, t0()), None);
        assert_eq!(
            ledger.update_price("A", 9_800.0, t0()),
            Some(SellReason::StopLoss)
        );
        assert_eq!(ledger.update_price("A", 9_700.0, t0()), None);
    }

    #[test]
    fn trailing_high_never_decreases() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());
        ledger.update_price("A", 10_300.0, t0());
        ledger.update_price("A", 10_250.0, t0());
        assert_eq!(
            ledger.get("A").unwrap().trailing,
            TrailingStop::Active { high: 10_300.0 }
        );
    }

    #[test]
    fn in_flight_sell_suppresses_then_self_heals() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());

        // Arm and fire the trailing stop
        ledger.update_price("A", 10_300.0, t0());
        let signal = ledger.update_price("A", 10_150.0, t0());
        assert_eq!(signal, Some(SellReason::TrailingSell));
        ledger.begin_sell("A", SellReason::TrailingSell, t0());

        // Inside the window the same condition is suppressed
        let later = t0() + chrono::Duration::seconds(10);
        assert_eq!(ledger.update_price("A", 10_150.0, later), None);

        // Past the window the guard clears and the signal re-emerges
        let much_later = t0() + chrono::Duration::seconds(31);
        assert_eq!(
            ledger.update_price("A", 10_150.0, much_later),
            Some(SellReason::TrailingSell)
        );
    }

    #[test]
    fn trailing_state_keeps_updating_while_sell_in_flight() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());
        ledger.update_price("A", 10_300.0, t0());
        ledger.begin_sell("A", SellReason::TrailingSell, t0());

        // New high while pending still ratchets the trailing high
        ledger.update_price("A", 10_500.0, t0() + chrono::Duration::seconds(5));
        assert_eq!(
            ledger.get("A").unwrap().trailing,
            TrailingStop::Active { high: 10_500.0 }
        );
    }

    #[test]
    fn close_produces_realized_trade_and_releases() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());
        ledger.add_fill("A", BuyTier::Second, 9_000.0, 10, None, t0());

        ledger.begin_sell("A", SellReason::TrailingSell, t0());
        let closed = ledger
            .close_on_sell_fill("A", 9_800.0, t0() + chrono::Duration::seconds(3))
            .unwrap();
        assert_eq!(closed.quantity, 20);
        assert!((closed.avg_buy_price - 9_500.0).abs() < 1e-9);
        assert!((closed.profit_amount - 6_000.0).abs() < 1e-9);
        assert_eq!(closed.reason, SellReason::TrailingSell);
        assert!(!ledger.contains("A"));
    }

    #[test]
    fn snapshot_round_trips_sub_states() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, Some(anchor()), t0());
        ledger.update_price("A", 10_300.0, t0());
        ledger.begin_sell("A", SellReason::TrailingSell, t0());

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let restored: HashMap<String, Position> = serde_json::from_str(&json).unwrap();
        let mut fresh = PositionLedger::new(config());
        fresh.restore(restored);

        let p = fresh.get("A").unwrap();
        assert_eq!(p.trailing, TrailingStop::Active { high: 10_300.0 });
        assert!(matches!(p.exit_in_flight, ExitInFlight::Pending { .. }));
        assert!(p.anchor.is_some());
    }

    #[test]
    fn stale_positions_are_flagged_not_sold() {
        let mut ledger = PositionLedger::new(config());
        ledger.add_fill("A", BuyTier::First, 10_000.0, 10, None, t0());
        assert!(ledger.stale_positions(t0()).is_empty());
        let aged = t0() + chrono::Duration::days(31);
        assert_eq!(ledger.stale_positions(aged), vec!["A".to_string()]);
        assert!(ledger.contains("A"));
    }
}
