//! OHLCV bar aggregation
//!
//! Builds base-granularity bars from raw ticks and derives every in-demand
//! higher timeframe by resampling completed base bars.
//!
//! Bucket boundaries are aligned to the Unix epoch (e.g. 5m buckets start at
//! minutes divisible by 5), so every consumer agrees on bucket identity
//! without coordination. Uses `Decimal` for all price and volume arithmetic.
//!
//! Skipped base buckets are backfilled with the previous close price and
//! zero volume, keeping derived buckets fully covered during quiet periods.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ids::Symbol;
use types::time::NANOS_PER_SEC;

use crate::events::Tick;

/// Supported bar timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    S1,
    S5,
    S15,
    S30,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Duration of this timeframe in nanoseconds.
    pub fn duration_nanos(&self) -> i64 {
        self.duration_secs() * NANOS_PER_SEC
    }

    /// Duration of this timeframe in seconds.
    pub fn duration_secs(&self) -> i64 {
        match self {
            Timeframe::S1 => 1,
            Timeframe::S5 => 5,
            Timeframe::S15 => 15,
            Timeframe::S30 => 30,
            Timeframe::M1 => 60,
            Timeframe::M3 => 3 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 4 * 3600,
            Timeframe::D1 => 86400,
        }
    }

    /// Wire label ("1m", "5m", "1h", ...).
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::S1 => "1s",
            Timeframe::S5 => "5s",
            Timeframe::S15 => "15s",
            Timeframe::S30 => "30s",
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// All supported timeframes, finest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::S1,
            Timeframe::S5,
            Timeframe::S15,
            Timeframe::S30,
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }

    /// Align a timestamp to this timeframe's boundary (floor).
    pub fn align_to_boundary(&self, timestamp_nanos: i64) -> i64 {
        timestamp_nanos.div_euclid(self.duration_nanos()) * self.duration_nanos()
    }

    /// Whether bars of this timeframe can be built from bars of `base`.
    pub fn is_derivable_from(&self, base: Timeframe) -> bool {
        *self >= base && self.duration_nanos() % base.duration_nanos() == 0
    }

    /// Number of `base` bars that make up one bar of this timeframe.
    pub fn base_bars_per_bucket(&self, base: Timeframe) -> usize {
        (self.duration_nanos() / base.duration_nanos()) as usize
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error parsing a timeframe label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe: {0}")]
pub struct UnknownTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = UnknownTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::all()
            .iter()
            .copied()
            .find(|tf| tf.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTimeframe(s.to_string()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = UnknownTimeframe;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label().to_string()
    }
}

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Start of the bucket `[bucket_start, bucket_start + timeframe)`.
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    /// False while the bucket is still accumulating ticks.
    pub is_complete: bool,
}

impl Bar {
    /// Open a new bar from the first tick in its bucket.
    fn open_at(
        symbol: Symbol,
        timeframe: Timeframe,
        bucket_start: i64,
        price: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            trade_count: 1,
            is_complete: false,
        }
    }

    /// Update the bar with a new tick.
    fn apply(&mut self, price: Decimal, volume: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
        self.trade_count += 1;
    }

    /// Create a flat (no-trade) bar for backfill.
    fn flat(symbol: Symbol, timeframe: Timeframe, bucket_start: i64, prev_close: Decimal) -> Self {
        Self {
            symbol,
            timeframe,
            bucket_start,
            open: prev_close,
            high: prev_close,
            low: prev_close,
            close: prev_close,
            volume: Decimal::ZERO,
            trade_count: 0,
            is_complete: true,
        }
    }

    /// Exclusive end of this bar's bucket.
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start + self.timeframe.duration_nanos()
    }

    /// Validate bar integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}

/// Aggregate consecutive bars into one bar of `timeframe`.
///
/// open = first open, high = max high, low = min low, close = last close,
/// volume = sum of volumes. Returns `None` for an empty slice.
pub fn resample(bars: &[Bar], timeframe: Timeframe) -> Option<Bar> {
    let first = bars.first()?;
    let last = bars.last()?;

    let mut high = first.high;
    let mut low = first.low;
    let mut volume = Decimal::ZERO;
    let mut trade_count = 0;
    for bar in bars {
        high = high.max(bar.high);
        low = low.min(bar.low);
        volume += bar.volume;
        trade_count += bar.trade_count;
    }

    Some(Bar {
        symbol: first.symbol.clone(),
        timeframe,
        bucket_start: timeframe.align_to_boundary(first.bucket_start),
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        trade_count,
        is_complete: true,
    })
}

/// Reasons a tick is refused by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickRejected {
    #[error("non-positive price {price}")]
    InvalidPrice { price: Decimal },

    #[error("negative volume {volume}")]
    InvalidVolume { volume: Decimal },

    #[error("late tick at {timestamp}: bucket {bucket_start} already closed")]
    Late { timestamp: i64, bucket_start: i64 },

    #[error("tick for {received} routed to aggregator for {expected}")]
    WrongSymbol { expected: Symbol, received: Symbol },
}

/// Per-symbol bar state machine.
///
/// Accumulates ticks into the current base bucket, closes it when a tick
/// crosses the bucket boundary, and derives higher timeframes from the
/// retained history of closed base bars.
pub struct TimeframeAggregator {
    symbol: Symbol,
    base: Timeframe,
    /// Currently accumulating base bar (not yet closed).
    current: Option<Bar>,
    /// Closed base bars by bucket start (BTreeMap for ordered range scans).
    history: BTreeMap<i64, Bar>,
    /// Max closed base bars to retain.
    max_history: usize,
}

impl TimeframeAggregator {
    pub fn new(symbol: Symbol, base: Timeframe, max_history: usize) -> Self {
        Self {
            symbol,
            base,
            current: None,
            history: BTreeMap::new(),
            max_history: max_history.max(1),
        }
    }

    /// Process a tick: close base bars it crosses, then derive every
    /// demanded timeframe whose bucket those closes completed.
    ///
    /// Returned bars are ordered by bucket time, each base bar followed by
    /// the derived bars it completed (finest timeframe first).
    pub fn on_tick(
        &mut self,
        tick: &Tick,
        demanded: &[Timeframe],
    ) -> Result<Vec<Bar>, TickRejected> {
        let closed_base = self.ingest(tick)?;
        let mut out = Vec::with_capacity(closed_base.len());
        for base_bar in closed_base {
            let derived = self.derive(&base_bar, demanded);
            out.push(base_bar);
            out.extend(derived);
        }
        Ok(out)
    }

    /// Apply a tick to the base bucket.
    ///
    /// Returns the base bars closed by this tick (the previous bucket plus
    /// any backfilled flat buckets), oldest first.
    pub fn ingest(&mut self, tick: &Tick) -> Result<Vec<Bar>, TickRejected> {
        if tick.symbol != self.symbol {
            return Err(TickRejected::WrongSymbol {
                expected: self.symbol.clone(),
                received: tick.symbol.clone(),
            });
        }
        if tick.price <= Decimal::ZERO {
            return Err(TickRejected::InvalidPrice { price: tick.price });
        }
        if tick.volume < Decimal::ZERO {
            return Err(TickRejected::InvalidVolume {
                volume: tick.volume,
            });
        }

        let boundary = self.base.align_to_boundary(tick.timestamp);
        let mut closed = Vec::new();

        if let Some(current) = self.current.as_mut() {
            if boundary == current.bucket_start {
                current.apply(tick.price, tick.volume);
                return Ok(closed);
            }
            if boundary < current.bucket_start {
                return Err(TickRejected::Late {
                    timestamp: tick.timestamp,
                    bucket_start: current.bucket_start,
                });
            }
            closed.extend(self.close_current());
        } else if let Some((&last_start, _)) = self.history.last_key_value() {
            if boundary <= last_start {
                return Err(TickRejected::Late {
                    timestamp: tick.timestamp,
                    bucket_start: last_start,
                });
            }
        }

        closed.extend(self.backfill_until(boundary));

        self.current = Some(Bar::open_at(
            self.symbol.clone(),
            self.base,
            boundary,
            tick.price,
            tick.volume,
        ));

        Ok(closed)
    }

    /// Force-close the current base bar (e.g., on shutdown).
    pub fn close_current(&mut self) -> Option<Bar> {
        let mut bar = self.current.take()?;
        bar.is_complete = true;
        self.history.insert(bar.bucket_start, bar.clone());
        self.trim_history();
        Some(bar)
    }

    /// Derive the demanded timeframes completed by `base_bar` closing.
    ///
    /// A derived bar is produced only when every base bucket it covers is
    /// present in history.
    pub fn derive(&self, base_bar: &Bar, demanded: &[Timeframe]) -> Vec<Bar> {
        let base_nanos = self.base.duration_nanos();
        let mut timeframes: Vec<Timeframe> = demanded
            .iter()
            .copied()
            .filter(|tf| *tf != self.base && tf.is_derivable_from(self.base))
            .collect();
        timeframes.sort();
        timeframes.dedup();

        let mut derived = Vec::new();
        for tf in timeframes {
            let bucket_start = tf.align_to_boundary(base_bar.bucket_start);
            let bucket_end = bucket_start + tf.duration_nanos();
            if base_bar.bucket_start + base_nanos != bucket_end {
                continue;
            }

            let covered: Vec<Bar> = self
                .history
                .range(bucket_start..bucket_end)
                .map(|(_, bar)| bar.clone())
                .collect();
            let expected = tf.base_bars_per_bucket(self.base);
            if covered.len() != expected {
                debug!(
                    symbol = %self.symbol,
                    timeframe = %tf,
                    bucket_start,
                    covered = covered.len(),
                    expected,
                    "Skipping partially covered derived bucket"
                );
                continue;
            }

            if let Some(bar) = resample(&covered, tf) {
                derived.push(bar);
            }
        }
        derived
    }

    /// Get the current (unclosed) base bar.
    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Most recent closed base bars, newest first.
    pub fn base_history(&self, limit: usize) -> Vec<Bar> {
        self.history.values().rev().take(limit).cloned().collect()
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.base
    }

    /// Close flat bars for every empty base bucket before `boundary`.
    fn backfill_until(&mut self, boundary: i64) -> Vec<Bar> {
        let Some((&last_start, last)) = self.history.last_key_value() else {
            return Vec::new();
        };
        let prev_close = last.close;
        let duration = self.base.duration_nanos();
        // Older backfill would be trimmed immediately anyway.
        let horizon = boundary.saturating_sub(duration.saturating_mul(self.max_history as i64));
        let mut t = (last_start + duration).max(horizon);

        let mut backfilled = Vec::new();
        while t < boundary {
            let bar = Bar::flat(self.symbol.clone(), self.base, t, prev_close);
            self.history.insert(t, bar.clone());
            backfilled.push(bar);
            t += duration;
        }
        self.trim_history();
        backfilled
    }

    /// Trim history to max_history.
    fn trim_history(&mut self) {
        while self.history.len() > self.max_history {
            self.history.pop_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nanos(minutes: i64) -> i64 {
        minutes * 60 * NANOS_PER_SEC
    }

    fn sym() -> Symbol {
        Symbol::try_new("SYM").unwrap()
    }

    fn tick(minute_offset_secs: i64, price: i64, volume: i64) -> Tick {
        Tick {
            symbol: sym(),
            price: Decimal::from(price),
            volume: Decimal::from(volume),
            timestamp: minute_offset_secs * NANOS_PER_SEC,
        }
    }

    fn minute_bar(minute: i64, o: i64, h: i64, l: i64, c: i64, v: i64) -> Bar {
        Bar {
            symbol: sym(),
            timeframe: Timeframe::M1,
            bucket_start: nanos(minute),
            open: Decimal::from(o),
            high: Decimal::from(h),
            low: Decimal::from(l),
            close: Decimal::from(c),
            volume: Decimal::from(v),
            trade_count: 1,
            is_complete: true,
        }
    }

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::M1.duration_nanos(), 60_000_000_000);
        assert_eq!(Timeframe::H1.duration_nanos(), 3_600_000_000_000);
        assert_eq!(Timeframe::D1.duration_nanos(), 86_400_000_000_000);
    }

    #[test]
    fn test_timeframe_alignment() {
        let ts = nanos(5) + 30 * NANOS_PER_SEC; // 5m30s
        assert_eq!(Timeframe::M1.align_to_boundary(ts), nanos(5));
        assert_eq!(Timeframe::M5.align_to_boundary(ts), nanos(5));
        assert_eq!(Timeframe::M15.align_to_boundary(ts), nanos(0));
        assert_eq!(Timeframe::M5.align_to_boundary(nanos(9)), nanos(5));
    }

    #[test]
    fn test_timeframe_labels() {
        assert_eq!("5m".parse::<Timeframe>().unwrap(), Timeframe::M5);
        assert_eq!("1H".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert!("7m".parse::<Timeframe>().is_err());
        assert_eq!(serde_json::to_string(&Timeframe::M15).unwrap(), "\"15m\"");
        let tf: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(tf, Timeframe::H4);
    }

    #[test]
    fn test_derivable() {
        assert!(Timeframe::M5.is_derivable_from(Timeframe::M1));
        assert!(Timeframe::M1.is_derivable_from(Timeframe::M1));
        assert!(!Timeframe::S30.is_derivable_from(Timeframe::M1));
        assert!(!Timeframe::M5.is_derivable_from(Timeframe::M3));
        assert_eq!(Timeframe::H1.base_bars_per_bucket(Timeframe::M1), 60);
    }

    #[test]
    fn test_resample_five_minute_bars() {
        let bars = vec![
            minute_bar(540, 100, 105, 95, 102, 50),
            minute_bar(541, 102, 110, 101, 108, 40),
            minute_bar(542, 108, 112, 106, 110, 30),
            minute_bar(543, 110, 115, 109, 113, 45),
            minute_bar(544, 113, 114, 108, 111, 35),
        ];

        let bar = resample(&bars, Timeframe::M5).unwrap();
        assert_eq!(bar.bucket_start, nanos(540));
        assert_eq!(bar.open, Decimal::from(100));
        assert_eq!(bar.high, Decimal::from(115));
        assert_eq!(bar.low, Decimal::from(95));
        assert_eq!(bar.close, Decimal::from(111));
        assert_eq!(bar.volume, Decimal::from(200));
        assert!(bar.is_complete);
        assert!(bar.is_valid());
        assert!(resample(&[], Timeframe::M5).is_none());
    }

    #[test]
    fn test_bar_accumulates_ticks() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);

        assert!(agg.ingest(&tick(10, 50000, 1)).unwrap().is_empty());
        assert!(agg.ingest(&tick(20, 51000, 2)).unwrap().is_empty());
        assert!(agg.ingest(&tick(30, 49000, 3)).unwrap().is_empty());
        assert!(agg.ingest(&tick(40, 50500, 1)).unwrap().is_empty());

        let current = agg.current_bar().unwrap();
        assert_eq!(current.open, Decimal::from(50000));
        assert_eq!(current.high, Decimal::from(51000));
        assert_eq!(current.low, Decimal::from(49000));
        assert_eq!(current.close, Decimal::from(50500));
        assert_eq!(current.volume, Decimal::from(7));
        assert_eq!(current.trade_count, 4);
        assert!(!current.is_complete);
    }

    #[test]
    fn test_bar_closes_at_boundary() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);

        agg.ingest(&tick(10, 50000, 1)).unwrap();
        let closed = agg.ingest(&tick(65, 51000, 2)).unwrap();

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bucket_start, 0);
        assert_eq!(closed[0].close, Decimal::from(50000));
        assert!(closed[0].is_complete);
        assert_eq!(agg.current_bar().unwrap().bucket_start, nanos(1));
    }

    #[test]
    fn test_gap_backfills_flat_bars() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);

        agg.ingest(&tick(10, 50000, 1)).unwrap();
        let closed = agg.ingest(&tick(3 * 60 + 5, 52000, 1)).unwrap();

        // Minute 0 closed, minutes 1 and 2 backfilled flat
        assert_eq!(closed.len(), 3);
        for bar in &closed[1..] {
            assert_eq!(bar.open, Decimal::from(50000));
            assert_eq!(bar.close, Decimal::from(50000));
            assert_eq!(bar.volume, Decimal::ZERO);
            assert_eq!(bar.trade_count, 0);
            assert!(bar.is_valid());
        }
        assert_eq!(closed[2].bucket_start, nanos(2));
    }

    #[test]
    fn test_late_tick_rejected() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);

        agg.ingest(&tick(70, 50000, 1)).unwrap();
        let result = agg.ingest(&tick(10, 50000, 1));
        assert!(matches!(result, Err(TickRejected::Late { .. })));
    }

    #[test]
    fn test_invalid_ticks_rejected() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);

        assert!(matches!(
            agg.ingest(&tick(1, 0, 1)),
            Err(TickRejected::InvalidPrice { .. })
        ));
        assert!(matches!(
            agg.ingest(&tick(1, 10, -1)),
            Err(TickRejected::InvalidVolume { .. })
        ));

        let mut other = tick(1, 10, 1);
        other.symbol = Symbol::try_new("OTHER").unwrap();
        assert!(matches!(
            agg.ingest(&other),
            Err(TickRejected::WrongSymbol { .. })
        ));
    }

    #[test]
    fn test_derived_bar_emitted_on_last_base_close() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);
        let demanded = [Timeframe::M5];

        // One tick per minute through minutes 0..=4
        for minute in 0..5 {
            let out = agg
                .on_tick(&tick(minute * 60 + 1, 100 + minute, 10), &demanded)
                .unwrap();
            assert!(out.iter().all(|b| b.timeframe == Timeframe::M1));
        }

        // Tick in minute 5 closes minute 4, completing [0m, 5m)
        let out = agg.on_tick(&tick(5 * 60 + 1, 200, 1), &demanded).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timeframe, Timeframe::M1);
        let derived = &out[1];
        assert_eq!(derived.timeframe, Timeframe::M5);
        assert_eq!(derived.bucket_start, 0);
        assert_eq!(derived.open, Decimal::from(100));
        assert_eq!(derived.close, Decimal::from(104));
        assert_eq!(derived.volume, Decimal::from(50));
    }

    #[test]
    fn test_derived_not_emitted_when_not_demanded() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);
        for minute in 0..6 {
            let out = agg.on_tick(&tick(minute * 60 + 1, 100, 1), &[]).unwrap();
            assert!(out.iter().all(|b| b.timeframe == Timeframe::M1));
        }
    }

    #[test]
    fn test_partial_bucket_not_emitted() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 100);
        let demanded = [Timeframe::M5];

        // Stream starts at minute 2: bucket [0m, 5m) is only partly covered
        for minute in 2..5 {
            agg.on_tick(&tick(minute * 60 + 1, 100, 1), &demanded).unwrap();
        }
        let out = agg.on_tick(&tick(5 * 60 + 1, 100, 1), &demanded).unwrap();
        assert!(out.iter().all(|b| b.timeframe == Timeframe::M1));
    }

    #[test]
    fn test_history_limit() {
        let mut agg = TimeframeAggregator::new(sym(), Timeframe::M1, 3);
        for minute in 0..5 {
            agg.ingest(&tick(minute * 60 + 5, 50000, 1)).unwrap();
        }
        agg.close_current();

        assert_eq!(agg.base_history(10).len(), 3);
        assert_eq!(agg.base_history(1)[0].bucket_start, nanos(4));
    }

    #[test]
    fn test_bar_serialization() {
        let bar = minute_bar(0, 100, 105, 95, 102, 50);
        let json = serde_json::to_string(&bar).unwrap();
        let deserialized: Bar = serde_json::from_str(&json).unwrap();
        assert_eq!(bar, deserialized);
    }
}
