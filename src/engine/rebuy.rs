//! Rebuy restriction ledger
//!
//! After a sell (or a manual stop) the symbol enters a cool-down window
//! during which rise detection refuses to re-track it. The admission path
//! consults this ledger before any re-entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::SellReason;

/// One restriction entry, persisted alongside the other snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionRecord {
    pub symbol: String,
    pub reason: SellReason,
    pub restricted_at: DateTime<Utc>,
}

/// Symbol → restriction map with a fixed-length window.
pub struct RebuyLedger {
    records: HashMap<String, RestrictionRecord>,
    restriction_days: i64,
}

impl RebuyLedger {
    pub fn new(restriction_days: i64) -> Self {
        Self {
            records: HashMap::new(),
            restriction_days,
        }
    }

    /// Start (or refresh) the cool-down for a symbol.
    pub fn record(&mut self, symbol: &str, reason: SellReason, now: DateTime<Utc>) {
        info!(symbol, %reason, days = self.restriction_days, "rebuy restriction recorded");
        self.records.insert(
            symbol.to_string(),
            RestrictionRecord {
                symbol: symbol.to_string(),
                reason,
                restricted_at: now,
            },
        );
    }

    /// Is the symbol still inside its cool-down window?
    pub fn is_restricted(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        match self.records.get(symbol) {
            Some(record) => {
                let restricted = (now - record.restricted_at).num_days() < self.restriction_days;
                if restricted {
                    debug!(symbol, "rebuy restricted");
                }
                restricted
            }
            None => false,
        }
    }

    /// Drop entries whose window has elapsed.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let days = self.restriction_days;
        let before = self.records.len();
        self.records
            .retain(|_, r| (now - r.restricted_at).num_days() < days);
        before - self.records.len()
    }

    pub fn set_restriction_days(&mut self, restriction_days: i64) {
        self.restriction_days = restriction_days;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, RestrictionRecord> {
        self.records.clone()
    }

    pub fn restore(&mut self, records: HashMap<String, RestrictionRecord>) {
        self.records = records;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 8, 6, 0, 0).unwrap()
    }

    #[test]
    fn scenario_e_window_boundaries() {
        let mut ledger = RebuyLedger::new(5);
        ledger.record("A", SellReason::TrailingSell, t0());

        assert!(ledger.is_restricted("A", t0() + chrono::Duration::days(2)));
        assert!(!ledger.is_restricted("A", t0() + chrono::Duration::days(6)));
        assert!(!ledger.is_restricted("B", t0()));
    }

    #[test]
    fn cleanup_drops_only_expired_entries() {
        let mut ledger = RebuyLedger::new(5);
        ledger.record("OLD", SellReason::StopLoss, t0());
        ledger.record("NEW", SellReason::StopLoss, t0() + chrono::Duration::days(4));

        let removed = ledger.cleanup(t0() + chrono::Duration::days(6));
        assert_eq!(removed, 1);
        assert!(!ledger.is_restricted("OLD", t0() + chrono::Duration::days(6)));
        assert!(ledger.is_restricted("NEW", t0() + chrono::Duration::days(6)));
    }
}
