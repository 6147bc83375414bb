//! Strategy engine - orchestrates the decision layer over the event stream
//!
//! Consumes inbound ticks and fills from a single mpsc receiver, drives the
//! rise tracker, support scorer, risk controller and position ledger, and
//! emits buy/sell intents fire-and-forget to the order transport. One
//! consumer task serializes all per-symbol transitions; a failure while
//! processing one symbol never takes down the loop.

pub mod rebuy;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::ledger::{EpisodeAnchor, PositionLedger};
use crate::matrix::RiseMatrix;
use crate::persistence::{RiskSettingsSnapshot, RiskSnapshot, SnapshotStore, RISK_HISTORY_TAIL};
use crate::risk::RiskController;
use crate::support::bars::{BarBuilder, BarInterval};
use crate::support::{SupportInputs, SupportScorer};
use crate::tracker::{RiseTracker, TrackerEvent, TrackerPolicy, TrackingStatus};
use crate::types::{
    BuyTier, EngineEvent, InboundTick, OrderFill, OrderIntent, OrderSide, SellReason,
};

/// Bars kept per (symbol, interval); enough history for every signal window.
const BAR_HISTORY: usize = 240;
/// How long an external confirmation signal keeps relaxing the scorer.
const EXTERNAL_CONFIRM_TTL_SECS: i64 = 300;
/// Periodic sweep cadence for the run loop.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Aggregated decision-layer statistics for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatistics {
    pub tracking: crate::tracker::TrackerStatistics,
    pub positions: crate::ledger::LedgerStatistics,
    pub trades: crate::risk::RiskStatistics,
    pub restricted_symbols: usize,
}

pub struct StrategyEngine {
    config: AppConfig,
    matrix: RiseMatrix,
    tracker: RiseTracker,
    ledger: PositionLedger,
    scorer: SupportScorer,
    risk: RiskController,
    rebuy: rebuy::RebuyLedger,
    bars: BarBuilder,
    store: SnapshotStore,
    intents: mpsc::UnboundedSender<OrderIntent>,
    /// Short-lived external confirmation marks from the screening boundary.
    external_confirmations: HashMap<String, DateTime<Utc>>,
}

impl StrategyEngine {
    pub fn new(
        config: AppConfig,
        intents: mpsc::UnboundedSender<OrderIntent>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let matrix = config.rise_matrix()?;
        let store = SnapshotStore::new(
            config.persistence.data_dir.clone(),
            config.persistence.csv_enabled,
        )?;
        Ok(Self {
            tracker: RiseTracker::new(config.tracking.max_tracking_stocks),
            ledger: PositionLedger::new(config.position.clone()),
            scorer: SupportScorer::new(config.support.clone()),
            risk: RiskController::new(config.risk.clone(), now.date_naive()),
            rebuy: rebuy::RebuyLedger::new(config.entry.rebuy_restriction_days),
            bars: BarBuilder::new(BAR_HISTORY),
            store,
            intents,
            external_confirmations: HashMap::new(),
            matrix,
            config,
        })
    }

    /// Swap in a new configuration. The matrix and ratio tables are rebuilt
    /// and replaced whole, so no evaluation ever sees a half-updated table;
    /// signal caches do not survive the change.
    pub fn apply_config(&mut self, config: AppConfig) -> Result<()> {
        self.matrix = config.rise_matrix()?;
        self.tracker
            .set_max_tracking(config.tracking.max_tracking_stocks);
        self.ledger.update_config(config.position.clone());
        self.scorer.update_config(config.support.clone());
        self.risk.update_config(config.risk.clone());
        self.rebuy
            .set_restriction_days(config.entry.rebuy_restriction_days);
        self.config = config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Restore persisted tracking, position, risk and restriction state.
    pub fn load_state(&mut self, now: DateTime<Utc>) {
        let tracking = self.store.load_tracking();
        if !tracking.is_empty() {
            info!(count = tracking.len(), "restored tracked episodes");
            self.tracker.restore(tracking);
        }
        let positions = self.store.load_positions();
        if !positions.is_empty() {
            info!(count = positions.len(), "restored open positions");
            self.ledger.restore(positions);
        }
        self.rebuy.restore(self.store.load_rebuy());
        if let Some(snapshot) = self.store.load_risk() {
            self.risk
                .restore(snapshot.daily_stats, snapshot.trade_history, now.date_naive());
        }
    }

    /// Dispatch one inbound event. Per-symbol failures surface here as a
    /// result the run loop logs and moves past.
    pub fn handle_event(&mut self, event: EngineEvent, now: DateTime<Utc>) -> Result<()> {
        match event {
            EngineEvent::Tick(tick) => self.handle_tick(&tick, now),
            EngineEvent::Fill(fill) => self.handle_fill(&fill, now),
            EngineEvent::CancelTracking(symbol) => {
                self.cancel_tracking(&symbol, now);
                Ok(())
            }
        }
    }

    /// One price tick: detection, tracking, entry gating, position upkeep.
    pub fn handle_tick(&mut self, tick: &InboundTick, now: DateTime<Utc>) -> Result<()> {
        if tick.symbol.is_empty() || tick.current_price <= 0.0 {
            debug!(symbol = %tick.symbol, price = tick.current_price, "malformed tick skipped");
            return Ok(());
        }
        let symbol = tick.symbol.as_str();

        if let Some(change_pct) = tick.day_change_pct {
            if change_pct >= self.config.tracking.rise_threshold_pct
                && !self.tracker.contains(symbol)
                && !self.ledger.contains(symbol)
            {
                self.maybe_start_tracking(symbol, tick.current_price, change_pct, now);
            }
        }

        if !self.tracker.contains(symbol) && !self.ledger.contains(symbol) {
            return Ok(());
        }

        let minute_volume = self
            .bars
            .add_tick(symbol, tick.current_price, tick.day_volume, now);
        if minute_volume > 0.0 {
            if let Some(candidate) = self.tracker.get_mut(symbol) {
                candidate.note_volume(minute_volume);
            }
        }

        if self.tracker.contains(symbol) {
            let policy = self.tracker_policy();
            if let Some(update) = self.tracker.update_price(
                symbol,
                &self.matrix,
                tick.current_price,
                tick.day_change_pct,
                tick.day_high_price,
                policy,
                now,
            ) {
                if update.high_updated {
                    self.refresh_position_anchor(symbol);
                    self.persist_tracking();
                }
                match update.event {
                    TrackerEvent::Expired | TrackerEvent::Stopped => {
                        if !self.ledger.contains(symbol) {
                            self.bars.forget(symbol);
                        }
                        self.persist_tracking();
                    }
                    _ => {}
                }
            }

            let ready = self
                .tracker
                .get(symbol)
                .map(|c| c.status == TrackingStatus::Ready)
                .unwrap_or(false);
            if ready {
                self.try_entry(symbol, now);
            }
        }

        if self.ledger.contains(symbol) {
            if let Some(reason) = self.ledger.update_price(symbol, tick.current_price, now) {
                self.emit_sell(symbol, reason, now);
            }
        }

        Ok(())
    }

    /// Mark an external confirmation (condition-screening boundary); relaxes
    /// the support requirement for a short window.
    pub fn confirm_external(&mut self, symbol: &str, now: DateTime<Utc>) {
        self.external_confirmations.insert(symbol.to_string(), now);
    }

    fn external_confirmed(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        self.external_confirmations
            .get(symbol)
            .map(|t| (now - *t).num_seconds() < EXTERNAL_CONFIRM_TTL_SECS)
            .unwrap_or(false)
    }

    fn tracker_policy(&self) -> TrackerPolicy {
        TrackerPolicy {
            max_rise_days: self.config.tracking.max_rise_days,
            max_waiting_days: self.config.tracking.max_waiting_days,
        }
    }

    fn maybe_start_tracking(
        &mut self,
        symbol: &str,
        price: f64,
        change_pct: f64,
        now: DateTime<Utc>,
    ) {
        if price < self.config.tracking.min_price || price > self.config.tracking.max_price {
            debug!(symbol, price, "outside tracked price bounds");
            return;
        }
        if self.rebuy.is_restricted(symbol, now) {
            info!(symbol, "rise detected but rebuy-restricted");
            return;
        }
        // The episode anchors at the rise's presumed starting point: the
        // previous close, back-computed from the day change.
        let start_price = price / (1.0 + change_pct / 100.0);
        if start_price <= 0.0 {
            return;
        }
        if self.tracker.add(symbol, start_price, &self.matrix, now) {
            self.persist_tracking();
        }
    }

    /// Gate one READY symbol through the scorer and the risk controller and
    /// emit the buy intent when everything passes.
    fn try_entry(&mut self, symbol: &str, now: DateTime<Utc>) {
        if let Some(reason) = self.risk.should_stop_trading(now) {
            debug!(symbol, %reason, "circuit breaker open, no entries");
            return;
        }
        if self.rebuy.is_restricted(symbol, now) {
            return;
        }

        let (tier, price, rise_days, rise_pct, episode_max_volume) = {
            let Some(candidate) = self.tracker.get(symbol) else {
                return;
            };
            let Some(tier) = candidate.available_tier() else {
                return;
            };
            (
                tier,
                candidate.current_price,
                candidate.rise_days,
                candidate.cumulative_rise_pct,
                (candidate.episode_max_volume > 0.0).then_some(candidate.episode_max_volume),
            )
        };

        let one_minute = self.bars.bars(symbol, BarInterval::Min1);
        let five_minute = self.bars.bars(symbol, BarInterval::Min5);
        let fifteen_minute = self.bars.bars(symbol, BarInterval::Min15);
        let current_volume = one_minute.last().map(|b| b.volume).filter(|v| *v > 0.0);
        let external = self.external_confirmed(symbol, now);

        let evaluation = self.scorer.evaluate(
            symbol,
            price,
            SupportInputs {
                one_minute: &one_minute,
                five_minute: &five_minute,
                fifteen_minute: &fifteen_minute,
                current_volume,
                episode_max_volume,
            },
            external,
            now,
        );
        let required = self.config.entry.required_for(tier);
        if evaluation.satisfied_count < required {
            debug!(
                symbol,
                %tier,
                satisfied = evaluation.satisfied_count,
                required,
                "support conditions not met"
            );
            return;
        }

        let assessment = self.risk.size_position(
            self.config.risk.base_buy_amount,
            rise_days,
            rise_pct,
            self.ledger.len(),
            now,
        );
        if !assessment.allowed {
            debug!(symbol, %tier, reason = %assessment.reason, "entry rejected");
            return;
        }

        let quantity = (assessment.final_amount / price).floor() as u32;
        if quantity == 0 {
            debug!(symbol, amount = assessment.final_amount, price, "sized to zero shares");
            return;
        }

        let intent = OrderIntent {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity,
            price: 0.0,
            urgent: false,
            reason: format!(
                "{tier} entry, {:.1}/{:.0} signals, {} risk",
                evaluation.satisfied_count, required, assessment.risk_level
            ),
        };
        if self.intents.send(intent).is_err() {
            error!(symbol, "intent channel closed, buy not submitted");
            return;
        }
        info!(
            symbol,
            %tier,
            quantity,
            amount = assessment.final_amount,
            risk = %assessment.risk_level,
            "buy intent emitted"
        );

        // The tier is consumed at submission: even a lost fill never makes
        // the same tier re-buyable for this episode.
        if let Some(candidate) = self.tracker.get_mut(symbol) {
            candidate.mark_tier_filled(tier);
        }
        self.persist_tracking();
    }

    fn emit_sell(&mut self, symbol: &str, reason: SellReason, now: DateTime<Utc>) {
        let Some(position) = self.ledger.get(symbol) else {
            return;
        };
        let quantity = position.total_quantity;
        if quantity == 0 {
            return;
        }

        let intent = OrderIntent {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            quantity,
            price: 0.0,
            urgent: matches!(reason, SellReason::StopLoss),
            reason: reason.to_string(),
        };
        if self.intents.send(intent).is_err() {
            error!(symbol, "intent channel closed, sell not submitted");
            return;
        }
        self.ledger.begin_sell(symbol, reason, now);
        info!(symbol, %reason, quantity, "sell intent emitted");
    }

    fn handle_fill(&mut self, fill: &OrderFill, now: DateTime<Utc>) -> Result<()> {
        if fill.filled_quantity == 0 || fill.filled_price <= 0.0 {
            warn!(symbol = %fill.symbol, "malformed fill skipped");
            return Ok(());
        }
        match fill.side {
            OrderSide::Buy => self.on_buy_filled(fill, now),
            OrderSide::Sell => self.on_sell_filled(fill, now),
        }
        Ok(())
    }

    fn on_buy_filled(&mut self, fill: &OrderFill, now: DateTime<Utc>) {
        let symbol = fill.symbol.as_str();
        // A fill without a tier lands on the next open slot.
        let tier = fill.tier.unwrap_or_else(|| {
            let next = self.ledger.get(symbol).map(|p| p.fills.len()).unwrap_or(0) as u8 + 1;
            BuyTier::from_index(next.min(3)).unwrap_or(BuyTier::Third)
        });

        let anchor = self.tracker.get(symbol).map(|c| EpisodeAnchor {
            start_price: c.start_price,
            high_price: c.high_price,
            stop_loss_pct: c.thresholds.stop_loss,
        });
        self.ledger.add_fill(
            symbol,
            tier,
            fill.filled_price,
            fill.filled_quantity,
            anchor,
            now,
        );
        self.risk.record_trade(
            OrderSide::Buy,
            symbol,
            fill.filled_price * fill.filled_quantity as f64,
            0.0,
            None,
            now,
        );

        // Mirror the tier into the episode; the entry phase completes when
        // all three are taken and the exit is the ledger's from here on.
        let completed = self
            .tracker
            .get_mut(symbol)
            .map(|c| c.mark_tier_filled(tier))
            .unwrap_or(false);
        if completed {
            self.tracker.remove(symbol);
        }
        self.persist_all();
    }

    fn on_sell_filled(&mut self, fill: &OrderFill, now: DateTime<Utc>) {
        let symbol = fill.symbol.as_str();
        match self.ledger.close_on_sell_fill(symbol, fill.filled_price, now) {
            Some(closed) => {
                self.risk.record_trade(
                    OrderSide::Sell,
                    symbol,
                    fill.filled_price * closed.quantity as f64,
                    closed.profit_amount,
                    Some(closed.reason),
                    now,
                );
                self.rebuy.record(symbol, closed.reason, now);
                self.tracker.remove(symbol);
                self.bars.forget(symbol);
                if let Err(err) = self.store.append_closed_trade(&closed) {
                    warn!(symbol, error = %err, "trade log append failed");
                }
                self.persist_all();
            }
            None => warn!(symbol, "sell fill without a known position"),
        }
    }

    fn cancel_tracking(&mut self, symbol: &str, now: DateTime<Utc>) {
        if self.tracker.remove(symbol).is_some() {
            // Manual stops cool down like sells so the symbol is not
            // immediately re-detected.
            self.rebuy.record(symbol, SellReason::Manual, now);
            if !self.ledger.contains(symbol) {
                self.bars.forget(symbol);
            }
            self.persist_tracking();
            self.persist_rebuy();
        }
    }

    fn refresh_position_anchor(&mut self, symbol: &str) {
        if let Some(candidate) = self.tracker.get(symbol) {
            let anchor = EpisodeAnchor {
                start_price: candidate.start_price,
                high_price: candidate.high_price,
                stop_loss_pct: candidate.thresholds.stop_loss,
            };
            self.ledger.refresh_anchor(symbol, anchor);
        }
    }

    /// Housekeeping behind the tick path: stale sweeps, restriction expiry,
    /// the exit safety net and a snapshot save.
    pub fn periodic_sweep(&mut self, now: DateTime<Utc>) {
        for symbol in self
            .tracker
            .cleanup_stale(now, self.config.tracking.cleanup_days)
        {
            if !self.ledger.contains(&symbol) {
                self.bars.forget(&symbol);
            }
        }
        for symbol in self.ledger.stale_positions(now) {
            warn!(symbol, "position idle past the cleanup window");
        }
        for (symbol, reason) in self.ledger.check_all(now) {
            self.emit_sell(&symbol, reason, now);
        }
        self.risk.cleanup_old_trades(now);
        self.rebuy.cleanup(now);
        self.external_confirmations
            .retain(|_, t| (now - *t).num_seconds() < EXTERNAL_CONFIRM_TTL_SECS);
        if let Some(reason) = self.risk.should_stop_trading(now) {
            debug!(%reason, "circuit breaker active");
        }
        self.persist_all();
    }

    /// Consume events until the channel closes. Cross-symbol updates never
    /// race because this is the only writer.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        let mut sweep =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        let now = Utc::now();
                        if let Err(err) = self.handle_event(event, now) {
                            error!(error = %err, "event handling failed, loop continues");
                        }
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.periodic_sweep(Utc::now());
                }
            }
        }

        info!("event stream closed, saving state");
        self.persist_all();
    }

    fn persist_tracking(&self) {
        if let Err(err) = self.store.save_tracking(&self.tracker.snapshot()) {
            warn!(error = %err, "tracking snapshot save failed");
        }
    }

    fn persist_rebuy(&self) {
        if let Err(err) = self.store.save_rebuy(&self.rebuy.snapshot()) {
            warn!(error = %err, "rebuy snapshot save failed");
        }
    }

    fn persist_all(&self) {
        self.persist_tracking();
        self.persist_rebuy();
        if let Err(err) = self.store.save_positions(&self.ledger.snapshot()) {
            warn!(error = %err, "position snapshot save failed");
        }
        let risk_snapshot = RiskSnapshot {
            settings: RiskSettingsSnapshot {
                daily_loss_limit: self.config.risk.daily_loss_limit,
                max_tracking_stocks: self.config.tracking.max_tracking_stocks,
                max_position_stocks: self.config.risk.max_position_stocks,
                max_single_position: self.config.risk.max_single_position,
                day_ratio_table: self.config.risk.day_ratio_table.clone(),
                rise_ratio_table: self.config.risk.rise_ratio_table.clone(),
            },
            daily_stats: Some(self.risk.daily_stats().clone()),
            trade_history: self.risk.history_tail(RISK_HISTORY_TAIL),
        };
        if let Err(err) = self.store.save_risk(&risk_snapshot) {
            warn!(error = %err, "risk snapshot save failed");
        }
    }

    // ── Introspection (operator surface and tests) ──────────────

    /// One aggregated snapshot of the decision layer.
    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            tracking: self.tracker.statistics(),
            positions: self.ledger.statistics(),
            trades: self.risk.risk_statistics(),
            restricted_symbols: self.rebuy.len(),
        }
    }

    pub fn tracker(&self) -> &RiseTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn risk(&self) -> &RiskController {
        &self.risk
    }

    pub fn rebuy(&self) -> &rebuy::RebuyLedger {
        &self.rebuy
    }
}
