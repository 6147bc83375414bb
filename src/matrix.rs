//! Rise matrix - cumulative rise to target pullback band lookup
//!
//! Maps how far a symbol has risen since its episode anchor to the pullback
//! band `[drop_min, drop_max]` that makes a re-entry attractive, and derives
//! the three buy tiers plus the stop-loss line from that band.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BuyTier;

/// Validation failures for a configured matrix.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("rise matrix must have at least one row")]
    Empty,
    #[error("rise matrix row has inverted bounds: rise {rise_min}..{rise_max} drop {drop_min}..{drop_max}")]
    InvertedBounds {
        rise_min: f64,
        rise_max: f64,
        drop_min: f64,
        drop_max: f64,
    },
    #[error("rise matrix rows overlap: {first_min}..{first_max} then {second_min}..{second_max}")]
    Overlap {
        first_min: f64,
        first_max: f64,
        second_min: f64,
        second_max: f64,
    },
}

/// One row of the rise matrix: rises inside `[rise_min, rise_max]` map to
/// the pullback band `[drop_min, drop_max]`. All values are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiseMatrixRow {
    pub rise_min: f64,
    pub rise_max: f64,
    pub drop_min: f64,
    pub drop_max: f64,
}

/// The three entry lines and the stop-loss line derived from one matrix row.
///
/// Tier 3 sits at 90% of the band rather than at `drop_max`, which keeps a
/// 10% buffer between the deepest buy and the stop-loss line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropThresholds {
    pub tier1: f64,
    pub tier2: f64,
    pub tier3: f64,
    pub stop_loss: f64,
}

impl DropThresholds {
    pub fn for_tier(&self, tier: BuyTier) -> f64 {
        match tier {
            BuyTier::First => self.tier1,
            BuyTier::Second => self.tier2,
            BuyTier::Third => self.tier3,
        }
    }
}

/// Ordered, immutable lookup table. Loaded once from configuration and
/// shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct RiseMatrix {
    rows: Vec<RiseMatrixRow>,
}

impl RiseMatrix {
    /// Build from configured rows, validating ordering up front so lookups
    /// never have to.
    pub fn new(rows: Vec<RiseMatrixRow>) -> Result<Self, MatrixError> {
        if rows.is_empty() {
            return Err(MatrixError::Empty);
        }
        for row in &rows {
            if row.rise_min > row.rise_max || row.drop_min > row.drop_max {
                return Err(MatrixError::InvertedBounds {
                    rise_min: row.rise_min,
                    rise_max: row.rise_max,
                    drop_min: row.drop_min,
                    drop_max: row.drop_max,
                });
            }
        }
        for pair in rows.windows(2) {
            if pair[1].rise_min < pair[0].rise_max {
                return Err(MatrixError::Overlap {
                    first_min: pair[0].rise_min,
                    first_max: pair[0].rise_max,
                    second_min: pair[1].rise_min,
                    second_max: pair[1].rise_max,
                });
            }
        }
        Ok(Self { rows })
    }

    /// Find the row containing `rise_pct`. Rises beyond the table fall back
    /// to the last row: extreme rises still get a pullback target instead of
    /// a rejection.
    pub fn lookup(&self, rise_pct: f64) -> &RiseMatrixRow {
        self.rows
            .iter()
            .find(|row| rise_pct >= row.rise_min && rise_pct <= row.rise_max)
            .unwrap_or_else(|| &self.rows[self.rows.len() - 1])
    }

    /// Derive the three buy tiers and the stop-loss line for a cumulative
    /// rise percentage.
    pub fn thresholds(&self, rise_pct: f64) -> DropThresholds {
        let row = self.lookup(rise_pct);
        let span = row.drop_max - row.drop_min;
        DropThresholds {
            tier1: row.drop_min,
            tier2: row.drop_min + span * 0.5,
            tier3: row.drop_min + span * 0.9,
            stop_loss: row.drop_max,
        }
    }

    pub fn rows(&self) -> &[RiseMatrixRow] {
        &self.rows
    }
}

/// Built-in pullback bands, tuned for multi-day parabolic rises. Overridable
/// via configuration.
pub fn default_rows() -> Vec<RiseMatrixRow> {
    vec![
        row(0.0, 20.0, 3.0, 8.0),
        row(20.0, 40.0, 5.0, 12.0),
        row(40.0, 60.0, 8.0, 15.0),
        row(60.0, 80.0, 10.0, 18.0),
        row(80.0, 100.0, 12.0, 20.0),
        row(100.0, 150.0, 15.0, 25.0),
        row(150.0, 999.0, 20.0, 30.0),
    ]
}

fn row(rise_min: f64, rise_max: f64, drop_min: f64, drop_max: f64) -> RiseMatrixRow {
    RiseMatrixRow {
        rise_min,
        rise_max,
        drop_min,
        drop_max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> RiseMatrix {
        RiseMatrix::new(default_rows()).unwrap()
    }

    #[test]
    fn lookup_is_total_over_non_negative_rises() {
        let m = matrix();
        for rise in [0.0, 0.1, 19.9, 20.0, 45.0, 99.9, 150.0, 400.0, 10_000.0] {
            let row = m.lookup(rise);
            assert!(row.drop_min <= row.drop_max, "rise {rise} gave inverted band");
        }
    }

    #[test]
    fn beyond_table_falls_back_to_last_row() {
        let m = matrix();
        let last = *m.rows().last().unwrap();
        assert_eq!(*m.lookup(5_000.0), last);
    }

    #[test]
    fn tiers_are_monotonic_and_tier3_stays_below_stop_loss() {
        let m = matrix();
        for rise in [0.0, 25.0, 45.0, 70.0, 90.0, 120.0, 500.0] {
            let t = m.thresholds(rise);
            assert!(t.tier1 <= t.tier2 && t.tier2 <= t.tier3);
            assert!(t.tier3 < t.stop_loss, "tier3 must keep a buffer before stop-loss");
        }
    }

    #[test]
    fn forty_to_sixty_band_derives_expected_lines() {
        let m = RiseMatrix::new(vec![RiseMatrixRow {
            rise_min: 40.0,
            rise_max: 60.0,
            drop_min: 8.0,
            drop_max: 15.0,
        }])
        .unwrap();
        let t = m.thresholds(45.0);
        assert!((t.tier1 - 8.0).abs() < 1e-9);
        assert!((t.tier2 - 11.5).abs() < 1e-9);
        assert!((t.tier3 - 14.3).abs() < 1e-9);
        assert!((t.stop_loss - 15.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_overlapping_rows() {
        let rows = vec![row(0.0, 30.0, 3.0, 8.0), row(20.0, 40.0, 5.0, 12.0)];
        assert!(RiseMatrix::new(rows).is_err());
    }

    #[test]
    fn rejects_empty_table() {
        assert!(RiseMatrix::new(Vec::new()).is_err());
    }
}
