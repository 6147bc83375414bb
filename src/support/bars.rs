//! Minute-bar builder - aggregates the tick stream into OHLCV bars
//!
//! Maintains rolling 1m/5m/15m windows per symbol for the support scorer.
//! Per-bar volume is derived from the cumulative day volume the feed
//! carries, when it carries one.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};

/// Bar granularities the scorer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarInterval {
    Min1,
    Min5,
    Min15,
}

impl BarInterval {
    pub const ALL: [BarInterval; 3] = [BarInterval::Min1, BarInterval::Min5, BarInterval::Min15];

    pub fn duration_secs(&self) -> i64 {
        match self {
            BarInterval::Min1 => 60,
            BarInterval::Min5 => 5 * 60,
            BarInterval::Min15 => 15 * 60,
        }
    }

    /// Aligned bucket start for a timestamp.
    fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        let secs = self.duration_secs();
        ts.timestamp() / secs * secs
    }
}

/// One completed (or forming) OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub start_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    fn new(start_ts: i64, price: f64) -> Self {
        Self {
            start_ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }

    fn update(&mut self, price: f64, volume_delta: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume_delta;
    }
}

/// Builds bars from ticks and keeps a bounded history per (symbol, interval).
pub struct BarBuilder {
    current: HashMap<(String, BarInterval), Bar>,
    history: HashMap<(String, BarInterval), VecDeque<Bar>>,
    /// (date, cumulative volume) last seen per symbol, for volume deltas.
    last_day_volume: HashMap<String, (NaiveDate, f64)>,
    max_history: usize,
}

impl BarBuilder {
    pub fn new(max_history: usize) -> Self {
        Self {
            current: HashMap::new(),
            history: HashMap::new(),
            last_day_volume: HashMap::new(),
            max_history,
        }
    }

    /// Fold one tick into every interval. Returns the per-tick volume delta
    /// so callers can track episode volume alongside.
    pub fn add_tick(
        &mut self,
        symbol: &str,
        price: f64,
        day_volume: Option<f64>,
        ts: DateTime<Utc>,
    ) -> f64 {
        let volume_delta = self.volume_delta(symbol, day_volume, ts);

        for interval in BarInterval::ALL {
            let key = (symbol.to_string(), interval);
            let bucket = interval.bucket_start(ts);

            match self.current.get_mut(&key) {
                Some(bar) if bar.start_ts == bucket => {
                    bar.update(price, volume_delta);
                }
                Some(bar) => {
                    let completed = *bar;
                    *bar = Bar::new(bucket, price);
                    bar.volume = volume_delta;
                    let hist = self.history.entry(key).or_default();
                    hist.push_back(completed);
                    while hist.len() > self.max_history {
                        hist.pop_front();
                    }
                }
                None => {
                    let mut bar = Bar::new(bucket, price);
                    bar.volume = volume_delta;
                    self.current.insert(key, bar);
                }
            }
        }

        volume_delta
    }

    /// Completed bars plus the forming one, oldest first.
    pub fn bars(&self, symbol: &str, interval: BarInterval) -> Vec<Bar> {
        let key = (symbol.to_string(), interval);
        let mut out: Vec<Bar> = self
            .history
            .get(&key)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        if let Some(bar) = self.current.get(&key) {
            out.push(*bar);
        }
        out
    }

    /// Drop a symbol's bars once it is no longer tracked or positioned.
    pub fn forget(&mut self, symbol: &str) {
        for interval in BarInterval::ALL {
            let key = (symbol.to_string(), interval);
            self.current.remove(&key);
            self.history.remove(&key);
        }
        self.last_day_volume.remove(symbol);
    }

    fn volume_delta(&mut self, symbol: &str, day_volume: Option<f64>, ts: DateTime<Utc>) -> f64 {
        let Some(cumulative) = day_volume else {
            return 0.0;
        };
        let today = ts.date_naive();
        let delta = match self.last_day_volume.get(symbol) {
            // Cumulative counter resets on a new session
            Some((date, prev)) if *date == today => (cumulative - prev).max(0.0),
            _ => cumulative,
        };
        self.last_day_volume
            .insert(symbol.to_string(), (today, cumulative));
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ticks_in_same_minute_share_a_bar() {
        let mut builder = BarBuilder::new(100);
        let base = at(0);
        // Align to the minute so both ticks land in one bucket
        let start = Utc.timestamp_opt(base.timestamp() / 60 * 60, 0).unwrap();
        builder.add_tick("A", 100.0, None, start);
        builder.add_tick("A", 103.0, None, start + chrono::Duration::seconds(20));
        builder.add_tick("A", 99.0, None, start + chrono::Duration::seconds(40));

        let bars = builder.bars("A", BarInterval::Min1);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].high, 103.0);
        assert_eq!(bars[0].low, 99.0);
        assert_eq!(bars[0].close, 99.0);
    }

    #[test]
    fn minute_rollover_completes_the_bar() {
        let mut builder = BarBuilder::new(100);
        let start = Utc.timestamp_opt(1_700_000_000 / 60 * 60, 0).unwrap();
        builder.add_tick("A", 100.0, None, start);
        builder.add_tick("A", 105.0, None, start + chrono::Duration::seconds(61));

        let bars = builder.bars("A", BarInterval::Min1);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 100.0);
        assert_eq!(bars[1].open, 105.0);
    }

    #[test]
    fn volume_deltas_come_from_cumulative_day_volume() {
        let mut builder = BarBuilder::new(100);
        let start = Utc.timestamp_opt(1_700_000_000 / 60 * 60, 0).unwrap();
        assert_eq!(builder.add_tick("A", 100.0, Some(1_000.0), start), 1_000.0);
        let d = builder.add_tick("A", 101.0, Some(1_400.0), start + chrono::Duration::seconds(10));
        assert_eq!(d, 400.0);
        // A shrinking counter never yields a negative delta
        let d = builder.add_tick("A", 101.0, Some(1_300.0), start + chrono::Duration::seconds(20));
        assert_eq!(d, 0.0);

        let bars = builder.bars("A", BarInterval::Min1);
        assert_eq!(bars[0].volume, 1_400.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut builder = BarBuilder::new(3);
        let start = Utc.timestamp_opt(1_700_000_000 / 60 * 60, 0).unwrap();
        for i in 0..10 {
            builder.add_tick("A", 100.0 + i as f64, None, start + chrono::Duration::minutes(i));
        }
        // 3 completed + the forming bar
        assert_eq!(builder.bars("A", BarInterval::Min1).len(), 4);
    }
}
