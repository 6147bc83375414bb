//! Rise tracker - per-symbol rise-episode state machine
//!
//! Tracks a multi-day price rise from its anchor (the presumed local low it
//! started at), maintains the running high and the pullback thresholds
//! derived from the rise matrix, and walks the
//! TRACKING → WAITING → READY → COMPLETED lifecycle with STOPPED for
//! invalidated episodes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::matrix::{DropThresholds, RiseMatrix};
use crate::types::BuyTier;

/// Episode lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingStatus {
    Tracking,
    Waiting,
    Ready,
    Completed,
    Stopped,
}

impl std::fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingStatus::Tracking => write!(f, "TRACKING"),
            TrackingStatus::Waiting => write!(f, "WAITING"),
            TrackingStatus::Ready => write!(f, "READY"),
            TrackingStatus::Completed => write!(f, "COMPLETED"),
            TrackingStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// What a price update did to the episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Pullback reached tier 1 (or deeper) while tracking or waiting.
    Ready,
    /// First non-new-high day observed, rebound wait started.
    WaitingStarted,
    /// New high while waiting resumed normal tracking.
    TrackingResumed,
    /// Waited out the full rebound window; act on what is available.
    ForcedReady,
    /// Tracking window elapsed without reaching tier 1.
    Expired,
    /// Pullback blew through the stop-loss line with no fill ever taken.
    Stopped,
    /// No state transition.
    None,
}

/// Result of folding one tick into a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub high_updated: bool,
    pub event: TrackerEvent,
}

/// Policy knobs the state machine consults on every update.
#[derive(Debug, Clone, Copy)]
pub struct TrackerPolicy {
    /// Episode expires after this many rise days without reaching tier 1.
    pub max_rise_days: u32,
    /// Consecutive non-new-high days before WAITING is forced READY.
    pub max_waiting_days: u32,
}

/// One day of the episode's price trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyPrice {
    pub date: NaiveDate,
    pub price: f64,
    pub is_high: bool,
}

/// Everything known about one tracked rise episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingCandidate {
    pub symbol: String,
    pub start_date: NaiveDate,
    /// Episode anchor; the rise is measured from here.
    pub start_price: f64,
    /// Running high, non-decreasing while the episode is active.
    pub high_price: f64,
    pub current_price: f64,
    #[serde(default)]
    pub day_change_pct: f64,
    /// Calendar days elapsed since the start date, inclusive.
    pub rise_days: u32,
    /// High vs start, percent.
    pub cumulative_rise_pct: f64,
    /// Pullback from the high, in rise-percentage units.
    pub drop_rate_pct: f64,
    pub thresholds: DropThresholds,
    pub waiting_days: u32,
    pub filled_tiers: BTreeSet<BuyTier>,
    pub status: TrackingStatus,
    pub last_update: DateTime<Utc>,
    pub daily_prices: Vec<DailyPrice>,
    /// Largest per-minute volume seen during the episode.
    #[serde(default)]
    pub episode_max_volume: f64,
}

impl TrackingCandidate {
    pub fn new(
        symbol: &str,
        start_price: f64,
        matrix: &RiseMatrix,
        now: DateTime<Utc>,
    ) -> Self {
        let start_date = now.date_naive();
        Self {
            symbol: symbol.to_string(),
            start_date,
            start_price,
            high_price: start_price,
            current_price: start_price,
            day_change_pct: 0.0,
            rise_days: 1,
            cumulative_rise_pct: 0.0,
            drop_rate_pct: 0.0,
            thresholds: matrix.thresholds(0.0),
            waiting_days: 0,
            filled_tiers: BTreeSet::new(),
            status: TrackingStatus::Tracking,
            last_update: now,
            daily_prices: vec![DailyPrice {
                date: start_date,
                price: start_price,
                is_high: false,
            }],
            episode_max_volume: 0.0,
        }
    }

    /// Fold one price update into the state machine.
    pub fn update_price(
        &mut self,
        matrix: &RiseMatrix,
        current_price: f64,
        day_change_pct: Option<f64>,
        day_high_price: Option<f64>,
        policy: TrackerPolicy,
        now: DateTime<Utc>,
    ) -> TrackerUpdate {
        self.current_price = current_price;
        if let Some(pct) = day_change_pct {
            self.day_change_pct = pct;
        }
        self.last_update = now;

        let today = now.date_naive();
        self.rise_days = (today - self.start_date).num_days().max(0) as u32 + 1;

        // An externally supplied day high beats the tick price when larger.
        let observed_high = match day_high_price {
            Some(h) if h > current_price => h,
            _ => current_price,
        };
        let was_waiting = self.status == TrackingStatus::Waiting;
        let high_updated = observed_high > self.high_price;
        if high_updated {
            let old_high = self.high_price;
            self.high_price = observed_high;
            self.recompute_thresholds(matrix);
            self.waiting_days = 0;
            if self.status == TrackingStatus::Waiting {
                self.status = TrackingStatus::Tracking;
            }
            debug!(
                symbol = %self.symbol,
                old_high,
                new_high = self.high_price,
                rise_pct = self.cumulative_rise_pct,
                "episode high updated"
            );
        }

        self.record_daily_price(today, current_price, high_updated);
        self.recompute_drop_rate();

        let resumed = high_updated && was_waiting;

        let event = match self.status {
            TrackingStatus::Tracking => {
                if self.drop_rate_pct >= self.thresholds.tier1 {
                    self.status = TrackingStatus::Ready;
                    info!(
                        symbol = %self.symbol,
                        drop = self.drop_rate_pct,
                        tier1 = self.thresholds.tier1,
                        "pullback reached entry band"
                    );
                    TrackerEvent::Ready
                } else if self.rise_days > policy.max_rise_days {
                    self.status = TrackingStatus::Completed;
                    info!(symbol = %self.symbol, days = self.rise_days, "episode expired");
                    TrackerEvent::Expired
                } else if resumed {
                    TrackerEvent::TrackingResumed
                } else if !high_updated && self.no_high_today(today) && self.rise_days > 1 {
                    self.status = TrackingStatus::Waiting;
                    self.waiting_days = 1;
                    info!(symbol = %self.symbol, "rebound wait started");
                    TrackerEvent::WaitingStarted
                } else {
                    TrackerEvent::None
                }
            }
            TrackingStatus::Waiting => {
                if self.drop_rate_pct >= self.thresholds.tier1 {
                    self.status = TrackingStatus::Ready;
                    info!(symbol = %self.symbol, drop = self.drop_rate_pct, "ready while waiting");
                    TrackerEvent::Ready
                } else if self.waiting_days >= policy.max_waiting_days {
                    // Stop waiting for a purer signal, act on what is there.
                    self.status = TrackingStatus::Ready;
                    info!(symbol = %self.symbol, days = self.waiting_days, "wait window elapsed, forcing ready");
                    TrackerEvent::ForcedReady
                } else {
                    TrackerEvent::None
                }
            }
            TrackingStatus::Ready => {
                if self.drop_rate_pct > self.thresholds.stop_loss && self.filled_tiers.is_empty() {
                    self.status = TrackingStatus::Stopped;
                    warn!(
                        symbol = %self.symbol,
                        drop = self.drop_rate_pct,
                        stop = self.thresholds.stop_loss,
                        "episode invalidated below stop-loss with no fills"
                    );
                    TrackerEvent::Stopped
                } else {
                    TrackerEvent::None
                }
            }
            TrackingStatus::Completed | TrackingStatus::Stopped => TrackerEvent::None,
        };

        TrackerUpdate {
            high_updated,
            event,
        }
    }

    /// Highest untaken tier whose threshold the pullback has met; the richer
    /// pullback wins. Nothing is offered beyond the stop-loss line.
    pub fn available_tier(&self) -> Option<BuyTier> {
        if self.status != TrackingStatus::Ready {
            return None;
        }
        if self.drop_rate_pct > self.thresholds.stop_loss {
            return None;
        }
        for tier in [BuyTier::Third, BuyTier::Second, BuyTier::First] {
            if self.drop_rate_pct >= self.thresholds.for_tier(tier)
                && !self.filled_tiers.contains(&tier)
            {
                return Some(tier);
            }
        }
        None
    }

    /// Consume a tier. Returns true when all three are now taken, which
    /// completes the episode's entry phase.
    pub fn mark_tier_filled(&mut self, tier: BuyTier) -> bool {
        self.filled_tiers.insert(tier);
        let all = self.filled_tiers.len() == BuyTier::ALL.len();
        if all {
            self.status = TrackingStatus::Completed;
            info!(symbol = %self.symbol, "all tiers taken, entry phase complete");
        }
        all
    }

    /// Track the largest per-minute volume seen during the episode.
    pub fn note_volume(&mut self, minute_volume: f64) {
        if minute_volume > self.episode_max_volume {
            self.episode_max_volume = minute_volume;
        }
    }

    fn recompute_thresholds(&mut self, matrix: &RiseMatrix) {
        self.cumulative_rise_pct =
            (self.high_price - self.start_price) / self.start_price * 100.0;
        self.thresholds = matrix.thresholds(self.cumulative_rise_pct);
    }

    /// Pullback measured in the same percentage units as the rise: the
    /// cumulative rise minus how far above the anchor the price sits now.
    /// This is not the naive (high-price)/high ratio.
    fn recompute_drop_rate(&mut self) {
        if self.start_price <= 0.0 {
            self.drop_rate_pct = 0.0;
            return;
        }
        let rise_from_start =
            (self.current_price - self.start_price) / self.start_price * 100.0;
        self.drop_rate_pct = (self.cumulative_rise_pct - rise_from_start).max(0.0);
    }

    fn record_daily_price(&mut self, today: NaiveDate, price: f64, high_updated: bool) {
        match self.daily_prices.last_mut() {
            Some(last) if last.date == today => {
                last.price = price;
                if high_updated {
                    last.is_high = true;
                }
            }
            _ => {
                // First tick of a new day; a waiting episode ages one day
                if self.status == TrackingStatus::Waiting && !high_updated {
                    self.waiting_days += 1;
                }
                self.daily_prices.push(DailyPrice {
                    date: today,
                    price,
                    is_high: high_updated,
                });
            }
        }
    }

    fn no_high_today(&self, today: NaiveDate) -> bool {
        if self.daily_prices.len() < 2 {
            return false;
        }
        self.daily_prices
            .iter()
            .rev()
            .find(|p| p.date == today)
            .map(|p| !p.is_high)
            .unwrap_or(true)
    }
}

/// Per-status counts for the operator surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStatistics {
    pub total: usize,
    pub tracking: usize,
    pub waiting: usize,
    pub ready: usize,
}

/// Owned store of every tracked episode. All mutation funnels through here
/// so the single-writer discipline stays enforceable.
pub struct RiseTracker {
    candidates: HashMap<String, TrackingCandidate>,
    max_tracking: usize,
}

impl RiseTracker {
    pub fn new(max_tracking: usize) -> Self {
        Self {
            candidates: HashMap::new(),
            max_tracking,
        }
    }

    /// Start tracking a detected rise. Refuses duplicates and respects the
    /// capacity limit.
    pub fn add(
        &mut self,
        symbol: &str,
        start_price: f64,
        matrix: &RiseMatrix,
        now: DateTime<Utc>,
    ) -> bool {
        if self.candidates.contains_key(symbol) {
            debug!(symbol, "already tracking");
            return false;
        }
        if self.candidates.len() >= self.max_tracking {
            warn!(
                symbol,
                tracked = self.candidates.len(),
                max = self.max_tracking,
                "tracking capacity reached"
            );
            return false;
        }
        let candidate = TrackingCandidate::new(symbol, start_price, matrix, now);
        info!(symbol, start_price, "tracking started");
        self.candidates.insert(symbol.to_string(), candidate);
        true
    }

    pub fn remove(&mut self, symbol: &str) -> Option<TrackingCandidate> {
        let removed = self.candidates.remove(symbol);
        if removed.is_some() {
            info!(symbol, "tracking removed");
        }
        removed
    }

    /// Fold a tick into the symbol's episode. Terminal outcomes (expiry,
    /// stop-out without fills) destroy the candidate here, which keeps
    /// lifecycle management in one place.
    pub fn update_price(
        &mut self,
        symbol: &str,
        matrix: &RiseMatrix,
        current_price: f64,
        day_change_pct: Option<f64>,
        day_high_price: Option<f64>,
        policy: TrackerPolicy,
        now: DateTime<Utc>,
    ) -> Option<TrackerUpdate> {
        let candidate = self.candidates.get_mut(symbol)?;
        let update = candidate.update_price(
            matrix,
            current_price,
            day_change_pct,
            day_high_price,
            policy,
            now,
        );
        if matches!(update.event, TrackerEvent::Expired | TrackerEvent::Stopped) {
            self.candidates.remove(symbol);
        }
        Some(update)
    }

    pub fn get(&self, symbol: &str) -> Option<&TrackingCandidate> {
        self.candidates.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut TrackingCandidate> {
        self.candidates.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.candidates.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrackingCandidate)> {
        self.candidates.iter()
    }

    /// Symbols whose episodes are ready for entry.
    pub fn ready_symbols(&self) -> Vec<String> {
        self.candidates
            .values()
            .filter(|c| c.status == TrackingStatus::Ready)
            .map(|c| c.symbol.clone())
            .collect()
    }

    /// Drop candidates that have not seen an update for `max_age_days`.
    pub fn cleanup_stale(&mut self, now: DateTime<Utc>, max_age_days: i64) -> Vec<String> {
        let cutoff = now - chrono::Duration::days(max_age_days);
        let stale: Vec<String> = self
            .candidates
            .values()
            .filter(|c| c.last_update < cutoff)
            .map(|c| c.symbol.clone())
            .collect();
        for symbol in &stale {
            self.candidates.remove(symbol);
            info!(symbol, "stale tracking removed");
        }
        stale
    }

    pub fn statistics(&self) -> TrackerStatistics {
        let mut stats = TrackerStatistics {
            total: self.candidates.len(),
            ..Default::default()
        };
        for c in self.candidates.values() {
            match c.status {
                TrackingStatus::Tracking => stats.tracking += 1,
                TrackingStatus::Waiting => stats.waiting += 1,
                TrackingStatus::Ready => stats.ready += 1,
                _ => {}
            }
        }
        stats
    }

    /// Snapshot for persistence, keyed by symbol.
    pub fn snapshot(&self) -> HashMap<String, TrackingCandidate> {
        self.candidates.clone()
    }

    pub fn restore(&mut self, candidates: HashMap<String, TrackingCandidate>) {
        self.candidates = candidates;
    }

    pub fn set_max_tracking(&mut self, max_tracking: usize) {
        self.max_tracking = max_tracking;
    }
}
