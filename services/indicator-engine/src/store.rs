//! Historical bar store
//!
//! The engine reads indicator windows from and writes every closed bar to a
//! `BarStore`. Durable storage is an external collaborator; the in-memory
//! store bounds history per series and is what the binary and tests use.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;
use types::ids::Symbol;

use crate::candles::{Bar, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("refusing to store incomplete bar {symbol}@{timeframe} at {bucket_start}")]
    IncompleteBar {
        symbol: Symbol,
        timeframe: Timeframe,
        bucket_start: i64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BarStore: Send + Sync {
    /// Closed bars with `bucket_start` in `range`, oldest first.
    async fn read(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Range<i64>,
    ) -> Result<Vec<Bar>, StoreError>;

    /// Persist a closed bar, replacing any bar with the same bucket.
    async fn write(&self, bar: &Bar) -> Result<(), StoreError>;
}

/// Bounded in-memory store keyed by series.
#[derive(Debug)]
pub struct InMemoryBarStore {
    series: DashMap<(Symbol, Timeframe), BTreeMap<i64, Bar>>,
    max_bars_per_series: usize,
}

impl InMemoryBarStore {
    pub fn new(max_bars_per_series: usize) -> Self {
        Self {
            series: DashMap::new(),
            max_bars_per_series: max_bars_per_series.max(1),
        }
    }

    /// Number of bars held for a series.
    pub fn len(&self, symbol: &Symbol, timeframe: Timeframe) -> usize {
        self.series
            .get(&(symbol.clone(), timeframe))
            .map_or(0, |bars| bars.len())
    }

    /// Seed history for a series, e.g. from a backfill job.
    pub fn seed(&self, bars: impl IntoIterator<Item = Bar>) {
        for bar in bars {
            self.insert(bar);
        }
    }

    fn insert(&self, bar: Bar) {
        let mut bars = self
            .series
            .entry((bar.symbol.clone(), bar.timeframe))
            .or_default();
        bars.insert(bar.bucket_start, bar);
        while bars.len() > self.max_bars_per_series {
            bars.pop_first();
        }
    }
}

impl Default for InMemoryBarStore {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn read(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Range<i64>,
    ) -> Result<Vec<Bar>, StoreError> {
        Ok(self
            .series
            .get(&(symbol.clone(), timeframe))
            .map(|bars| bars.range(range).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn write(&self, bar: &Bar) -> Result<(), StoreError> {
        if !bar.is_complete {
            warn!(symbol = %bar.symbol, timeframe = %bar.timeframe, "Rejected incomplete bar write");
            return Err(StoreError::IncompleteBar {
                symbol: bar.symbol.clone(),
                timeframe: bar.timeframe,
                bucket_start: bar.bucket_start,
            });
        }
        self.insert(bar.clone());
        Ok(())
    }
}
