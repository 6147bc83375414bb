//! Support scorer - the three confirmation signals gating a dip entry
//!
//! Evaluates an oversold oscillator, proximity to a validated support level
//! and volume exhaustion for one symbol. Each signal is cached on a coarse
//! time bucket so a tick storm cannot force constant recomputation.

pub mod bars;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::SupportConfig;
use bars::Bar;

/// Ephemeral per-symbol evaluation result.
#[derive(Debug, Clone)]
pub struct SupportEvaluation {
    pub oscillator_oversold: bool,
    pub support_near: bool,
    pub volume_dried: bool,
    /// Count of satisfied signals; external confirmation adds 0.5, capped at 3.
    pub satisfied_count: f64,
    pub oscillator_value: Option<f64>,
    pub volume_ratio: Option<f64>,
}

/// Already-fetched market data the scorer consumes. The engine assembles
/// this from its bar builder and the tracked episode.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportInputs<'a> {
    pub one_minute: &'a [Bar],
    pub five_minute: &'a [Bar],
    pub fifteen_minute: &'a [Bar],
    /// Most recent per-minute volume, when the feed carries volume.
    pub current_volume: Option<f64>,
    /// Largest per-minute volume observed during the rise episode.
    pub episode_max_volume: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct OscillatorEntry {
    bucket: i64,
    value: Option<f64>,
    oversold: bool,
}

#[derive(Debug, Clone)]
struct SupportEntry {
    bucket: i64,
    levels: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
struct VolumeEntry {
    bucket: i64,
    ratio: Option<f64>,
    dried: bool,
}

/// Evaluates and caches the three support signals.
pub struct SupportScorer {
    config: SupportConfig,
    oscillator_cache: HashMap<String, OscillatorEntry>,
    support_cache: HashMap<String, SupportEntry>,
    volume_cache: HashMap<String, VolumeEntry>,
}

const OSCILLATOR_BUCKET_SECS: i64 = 60;
const SUPPORT_BUCKET_SECS: i64 = 300;
const VOLUME_BUCKET_SECS: i64 = 60;

impl SupportScorer {
    pub fn new(config: SupportConfig) -> Self {
        Self {
            config,
            oscillator_cache: HashMap::new(),
            support_cache: HashMap::new(),
            volume_cache: HashMap::new(),
        }
    }

    /// Swap in new thresholds. Caches must not survive a config change.
    pub fn update_config(&mut self, config: SupportConfig) {
        self.config = config;
        self.clear_cache();
    }

    pub fn clear_cache(&mut self) {
        self.oscillator_cache.clear();
        self.support_cache.clear();
        self.volume_cache.clear();
    }

    /// Evaluate all three signals for one symbol.
    pub fn evaluate(
        &mut self,
        symbol: &str,
        current_price: f64,
        inputs: SupportInputs<'_>,
        external_confirmation: bool,
        now: DateTime<Utc>,
    ) -> SupportEvaluation {
        let (oversold, oscillator_value) = self.oscillator_oversold(symbol, inputs.one_minute, now);
        let support_near = self.support_near(symbol, current_price, &inputs, now);
        let (volume_dried, volume_ratio) = self.volume_dried(symbol, &inputs, now);

        let raw = [oversold, support_near, volume_dried]
            .iter()
            .filter(|s| **s)
            .count() as f64;
        // An external confirmation signal relaxes, it never passes outright.
        let satisfied_count = if external_confirmation {
            (raw + 0.5).min(3.0)
        } else {
            raw
        };

        debug!(
            symbol,
            oversold,
            support_near,
            volume_dried,
            satisfied_count,
            external_confirmation,
            "support evaluation"
        );

        SupportEvaluation {
            oscillator_oversold: oversold,
            support_near,
            volume_dried,
            satisfied_count,
            oscillator_value,
            volume_ratio,
        }
    }

    fn oscillator_oversold(
        &mut self,
        symbol: &str,
        one_minute: &[Bar],
        now: DateTime<Utc>,
    ) -> (bool, Option<f64>) {
        let bucket = now.timestamp() / OSCILLATOR_BUCKET_SECS;
        if let Some(entry) = self.oscillator_cache.get(symbol) {
            if entry.bucket == bucket {
                return (entry.oversold, entry.value);
            }
        }

        let closes: Vec<f64> = one_minute.iter().map(|b| b.close).collect();
        let value = compute_oscillator(&closes, self.config.rsi_period);
        let oversold = value
            .map(|v| v <= self.config.rsi_threshold)
            .unwrap_or(false);

        self.oscillator_cache.insert(
            symbol.to_string(),
            OscillatorEntry {
                bucket,
                value,
                oversold,
            },
        );
        (oversold, value)
    }

    fn support_near(
        &mut self,
        symbol: &str,
        current_price: f64,
        inputs: &SupportInputs<'_>,
        now: DateTime<Utc>,
    ) -> bool {
        let bucket = now.timestamp() / SUPPORT_BUCKET_SECS;
        let levels = match self.support_cache.get(symbol) {
            // Levels are stable for the bucket; nearness is rechecked live
            Some(entry) if entry.bucket == bucket => entry.levels.clone(),
            _ => {
                let mut levels = find_support_levels(
                    inputs.five_minute,
                    self.config.support_lookback,
                    self.config.bounce_min_pct,
                );
                levels.extend(find_support_levels(
                    inputs.fifteen_minute,
                    self.config.support_lookback,
                    self.config.bounce_min_pct,
                ));
                levels.sort_by(|a, b| a.total_cmp(b));
                levels.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
                self.support_cache.insert(
                    symbol.to_string(),
                    SupportEntry {
                        bucket,
                        levels: levels.clone(),
                    },
                );
                levels
            }
        };

        let tolerance = self.config.support_tolerance_pct / 100.0;
        levels.iter().any(|level| {
            *level > 0.0 && ((current_price - level).abs() / level) <= tolerance
        })
    }

    fn volume_dried(
        &mut self,
        symbol: &str,
        inputs: &SupportInputs<'_>,
        now: DateTime<Utc>,
    ) -> (bool, Option<f64>) {
        let bucket = now.timestamp() / VOLUME_BUCKET_SECS;
        if let Some(entry) = self.volume_cache.get(symbol) {
            if entry.bucket == bucket {
                return (entry.dried, entry.ratio);
            }
        }

        // Missing volume data yields a neutral (not-dried) result
        let ratio = match (inputs.current_volume, inputs.episode_max_volume) {
            (Some(current), Some(max)) if max > 0.0 => Some(current / max),
            _ => None,
        };
        let dried = ratio
            .map(|r| r <= self.config.volume_ratio_threshold)
            .unwrap_or(false);

        self.volume_cache.insert(
            symbol.to_string(),
            VolumeEntry {
                bucket,
                ratio,
                dried,
            },
        );
        (dried, ratio)
    }
}

/// 14-period average-gain/average-loss oscillator over closes. Returns None
/// on insufficient history; callers treat that as neutral, never an error.
fn compute_oscillator(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gain_sum += delta;
        } else {
            loss_sum += -delta;
        }
    }
    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;

    if avg_loss == 0.0 {
        // Flat history is neutral, pure gains are maximally overbought
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Local-minimum lows that later bounced at least `bounce_min_pct`. A low
/// with no bounce afterward is not a support, it is just a low.
fn find_support_levels(data: &[Bar], lookback: usize, bounce_min_pct: f64) -> Vec<f64> {
    if data.len() < lookback {
        return Vec::new();
    }

    let mut levels = Vec::new();
    let lows: Vec<f64> = data.iter().map(|b| b.low).collect();

    let upper = data.len().saturating_sub(lookback);
    for i in lookback..upper {
        let left_min = lows[i - lookback..i].iter().copied().fold(f64::MAX, f64::min);
        let right_end = (i + 1 + lookback).min(lows.len());
        let right_min = lows[i + 1..right_end].iter().copied().fold(f64::MAX, f64::min);
        let current = lows[i];

        if current <= left_min && current <= right_min && current > 0.0 {
            let bounce_window = &data[i + 1..(i + 1 + lookback).min(data.len())];
            if bounce_window.is_empty() {
                continue;
            }
            let max_bounce = bounce_window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let bounce_pct = (max_bounce - current) / current * 100.0;
            if bounce_pct >= bounce_min_pct {
                levels.push(current);
            }
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> SupportConfig {
        SupportConfig {
            rsi_period: 14,
            rsi_threshold: 30.0,
            volume_ratio_threshold: 0.25,
            support_tolerance_pct: 1.0,
            support_lookback: 3,
            bounce_min_pct: 2.0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn bar(low: f64, high: f64, close: f64) -> Bar {
        Bar {
            start_ts: 0,
            open: close,
            high,
            low,
            close,
            volume: 0.0,
        }
    }

    fn flat_bars(n: usize, price: f64) -> Vec<Bar> {
        (0..n).map(|_| bar(price, price, price)).collect()
    }

    #[test]
    fn oscillator_needs_period_plus_one_closes() {
        assert_eq!(compute_oscillator(&[1.0; 14], 14), None);
        assert_eq!(compute_oscillator(&[1.0; 15], 14), Some(50.0));
    }

    #[test]
    fn oscillator_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(compute_oscillator(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let value = compute_oscillator(&falling, 14).unwrap();
        assert!(value < 1.0, "straight decline should read near zero, got {value}");
    }

    #[test]
    fn insufficient_history_is_neutral_not_oversold() {
        let mut scorer = SupportScorer::new(config());
        let bars = flat_bars(5, 100.0);
        let eval = scorer.evaluate(
            "A",
            100.0,
            SupportInputs {
                one_minute: &bars,
                ..Default::default()
            },
            false,
            now(),
        );
        assert!(!eval.oscillator_oversold);
        assert_eq!(eval.oscillator_value, None);
    }

    #[test]
    fn validated_low_counts_as_support_near_price() {
        // Build a V shape: decline, low at 90, bounce beyond 2%
        let mut bars = Vec::new();
        for p in [100.0, 98.0, 96.0] {
            bars.push(bar(p, p + 1.0, p));
        }
        bars.push(bar(90.0, 91.0, 90.5)); // the local minimum
        for p in [93.0, 95.0, 97.0, 99.0] {
            bars.push(bar(p - 1.0, p, p));
        }

        let levels = find_support_levels(&bars, 3, 2.0);
        assert_eq!(levels, vec![90.0]);

        let mut scorer = SupportScorer::new(config());
        let eval = scorer.evaluate(
            "A",
            90.5,
            SupportInputs {
                five_minute: &bars,
                ..Default::default()
            },
            false,
            now(),
        );
        assert!(eval.support_near);

        // 5% away is outside the 1% tolerance
        let eval = scorer.evaluate(
            "A",
            94.5,
            SupportInputs {
                five_minute: &bars,
                ..Default::default()
            },
            false,
            now().checked_add_signed(chrono::Duration::seconds(301)).unwrap(),
        );
        assert!(!eval.support_near);
    }

    #[test]
    fn low_without_bounce_is_not_support() {
        // Decline straight through the low, no recovery
        let mut bars = Vec::new();
        for p in [100.0, 98.0, 96.0, 90.0, 89.0, 88.5, 88.0, 87.5] {
            bars.push(bar(p, p + 0.2, p));
        }
        assert!(find_support_levels(&bars, 3, 2.0).is_empty());
    }

    #[test]
    fn volume_dried_at_quarter_of_episode_max() {
        let mut scorer = SupportScorer::new(config());
        let eval = scorer.evaluate(
            "A",
            100.0,
            SupportInputs {
                current_volume: Some(2_000.0),
                episode_max_volume: Some(10_000.0),
                ..Default::default()
            },
            false,
            now(),
        );
        assert!(eval.volume_dried);
        assert_eq!(eval.volume_ratio, Some(0.2));

        let eval = scorer.evaluate(
            "B",
            100.0,
            SupportInputs {
                current_volume: Some(5_000.0),
                episode_max_volume: Some(10_000.0),
                ..Default::default()
            },
            false,
            now(),
        );
        assert!(!eval.volume_dried);
    }

    #[test]
    fn missing_volume_is_neutral() {
        let mut scorer = SupportScorer::new(config());
        let eval = scorer.evaluate("A", 100.0, SupportInputs::default(), false, now());
        assert!(!eval.volume_dried);
        assert_eq!(eval.volume_ratio, None);
    }

    #[test]
    fn external_confirmation_relaxes_by_half_a_signal() {
        let mut scorer = SupportScorer::new(config());
        let eval = scorer.evaluate(
            "A",
            100.0,
            SupportInputs {
                current_volume: Some(1_000.0),
                episode_max_volume: Some(10_000.0),
                ..Default::default()
            },
            true,
            now(),
        );
        assert!((eval.satisfied_count - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn relaxation_caps_at_three() {
        let mut scorer = SupportScorer::new(config());
        // Force all three by oversold decline + support V + dried volume
        let falling: Vec<Bar> = (0..20).map(|i| bar(100.0 - i as f64, 100.0 - i as f64, 100.0 - i as f64)).collect();
        let mut v_shape = Vec::new();
        for p in [100.0, 98.0, 96.0] {
            v_shape.push(bar(p, p + 1.0, p));
        }
        v_shape.push(bar(81.0, 82.0, 81.0));
        for p in [84.0, 86.0, 88.0, 90.0] {
            v_shape.push(bar(p - 1.0, p, p));
        }
        let eval = scorer.evaluate(
            "A",
            81.0,
            SupportInputs {
                one_minute: &falling,
                five_minute: &v_shape,
                current_volume: Some(100.0),
                episode_max_volume: Some(10_000.0),
                ..Default::default()
            },
            true,
            now(),
        );
        assert!((eval.satisfied_count - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cached_result_survives_within_the_minute_bucket() {
        let mut scorer = SupportScorer::new(config());
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let bars: Vec<Bar> = falling.iter().map(|p| bar(*p, *p, *p)).collect();
        let t0 = now();

        let first = scorer.evaluate(
            "A",
            80.0,
            SupportInputs {
                one_minute: &bars,
                ..Default::default()
            },
            false,
            t0,
        );
        assert!(first.oscillator_oversold);

        // Same bucket, different (empty) bars: cache answers
        let cached = scorer.evaluate("A", 80.0, SupportInputs::default(), false, t0);
        assert!(cached.oscillator_oversold);

        // Config update clears caches, and the empty inputs now read neutral
        scorer.update_config(config());
        let fresh = scorer.evaluate("A", 80.0, SupportInputs::default(), false, t0);
        assert!(!fresh.oscillator_oversold);
    }
}
