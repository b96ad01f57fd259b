//! Indicator identity
//!
//! An `IndicatorKey` is the canonical identity of one computed series and is
//! used unchanged for caching, leasing and subscription indexing. Two
//! requests that differ only in a parameter value are different keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use types::ids::Symbol;

use crate::candles::Timeframe;

/// Immutable (symbol, timeframe, indicator, parameters) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndicatorKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// Canonical (upper-case) indicator name.
    pub indicator: String,
    /// Parameter values in the indicator's declared order.
    pub params: Vec<u32>,
}

impl IndicatorKey {
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        indicator: impl Into<String>,
        params: Vec<u32>,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            indicator: indicator.into(),
            params,
        }
    }

    /// Field name used in delivery messages, e.g. `RSI_14`, `MACD_12_26_9`.
    pub fn label(&self) -> String {
        let mut label = self.indicator.clone();
        for param in &self.params {
            label.push('_');
            label.push_str(&param.to_string());
        }
        label
    }

    /// Whether this key belongs to the given series.
    pub fn is_on(&self, symbol: &Symbol, timeframe: Timeframe) -> bool {
        &self.symbol == symbol && self.timeframe == timeframe
    }
}

impl fmt::Display for IndicatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.symbol, self.timeframe, self.label())
    }
}

/// Client-supplied indicator request, before validation.
///
/// `{"name": "MACD", "params": {"fast": 12, "slow": 26, "signal": 9}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, i64>,
}

impl IndicatorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, name: impl Into<String>, value: i64) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}
