//! Core types used throughout DipBot
//!
//! Defines the shared data structures for ticks, fills, order intents and
//! the tier/exit vocabulary of the dip-buy strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of up to three partial entries taken at progressively deeper pullbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuyTier {
    First,
    Second,
    Third,
}

impl BuyTier {
    pub const ALL: [BuyTier; 3] = [BuyTier::First, BuyTier::Second, BuyTier::Third];

    /// Parse from the persisted form (1, 2, 3).
    pub fn from_index(idx: u8) -> Option<Self> {
        match idx {
            1 => Some(BuyTier::First),
            2 => Some(BuyTier::Second),
            3 => Some(BuyTier::Third),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            BuyTier::First => 1,
            BuyTier::Second => 2,
            BuyTier::Third => 3,
        }
    }
}

impl fmt::Display for BuyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.index())
    }
}

/// Order side for intents and fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a sell intent was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SellReason {
    StopLoss,
    TrailingSell,
    Manual,
    Expired,
}

impl fmt::Display for SellReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SellReason::StopLoss => write!(f, "STOP_LOSS"),
            SellReason::TrailingSell => write!(f, "TRAILING_SELL"),
            SellReason::Manual => write!(f, "MANUAL"),
            SellReason::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Inbound realtime tick from the market-data collaborator.
///
/// `day_change_pct`, `day_high_price` and `day_volume` may be absent;
/// absence skips the refinement they feed, it is never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTick {
    pub symbol: String,
    pub current_price: f64,
    /// Change vs previous close, percent.
    #[serde(default)]
    pub day_change_pct: Option<f64>,
    /// Intraday high so far, when the feed carries it.
    #[serde(default)]
    pub day_high_price: Option<f64>,
    /// Cumulative traded volume for the day, when the feed carries it.
    #[serde(default)]
    pub day_volume: Option<f64>,
}

/// Inbound order result (fill) from the order-transport collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub symbol: String,
    pub side: OrderSide,
    pub filled_price: f64,
    pub filled_quantity: u32,
    /// Which entry tier the buy belonged to (buys only).
    #[serde(default)]
    pub tier: Option<BuyTier>,
}

/// Outbound order intent, fire-and-forget to the order transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Unique intent id, for transport-side dedup and diagnostics.
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    /// Limit price; 0.0 means market order.
    pub price: f64,
    /// Urgent intents (stop-loss) should jump the transport queue.
    pub urgent: bool,
    pub reason: String,
}

/// Event stream consumed by the engine loop. All state transitions for a
/// symbol happen on this single consumer, which is the serialization
/// discipline the decision layer relies on.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Tick(InboundTick),
    Fill(OrderFill),
    /// Manual tracking cancel from the operator surface.
    CancelTracking(String),
}

/// Realized result of one closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub quantity: u32,
    pub avg_buy_price: f64,
    pub sell_price: f64,
    pub profit_amount: f64,
    pub profit_rate_pct: f64,
    pub reason: SellReason,
    pub closed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_index_round_trip() {
        for tier in BuyTier::ALL {
            assert_eq!(BuyTier::from_index(tier.index()), Some(tier));
        }
        assert_eq!(BuyTier::from_index(0), None);
        assert_eq!(BuyTier::from_index(4), None);
    }

    #[test]
    fn tick_optional_fields_deserialize_when_absent() {
        let tick: InboundTick =
            serde_json::from_str(r#"{"symbol":"005930","current_price":71200.0}"#).unwrap();
        assert!(tick.day_change_pct.is_none());
        assert!(tick.day_high_price.is_none());
        assert!(tick.day_volume.is_none());
    }
}
