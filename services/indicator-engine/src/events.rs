//! Internal event definitions for the indicator engine
//!
//! Components never call each other through callbacks: raw ticks, demand
//! changes, bar closes and computed results flow between them as the
//! messages defined here, over tokio channels.
//!
//! ```text
//! Tick ──► symbol worker ──► SchedulerInput::BarClosed ──► scheduler ──► DeliveryEvent ──► router
//!                 registry ──► SchedulerInput::Demand ───────┘
//! ```

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::Symbol;

use crate::cache::ComputedValue;
use crate::candles::{Bar, Timeframe};
use crate::key::IndicatorKey;

/// A raw trade/quote tick from the external feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub volume: Decimal,
    /// Unix nanoseconds timestamp from the feed.
    pub timestamp: i64,
}

/// Reference-count transition of an indicator key.
///
/// Emitted by the registry under the same lock that performed the
/// transition, so signals for one key are never reordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DemandSignal {
    /// ref_count went 0 → 1: start scheduling the key.
    Start(IndicatorKey),
    /// ref_count went 1 → 0: stop scheduling the key.
    Stop(IndicatorKey),
}

impl DemandSignal {
    pub fn key(&self) -> &IndicatorKey {
        match self {
            DemandSignal::Start(key) | DemandSignal::Stop(key) => key,
        }
    }
}

/// Input queue of the computation scheduler.
///
/// Demand changes and bar closes share one FIFO so that a subscription made
/// before a bar closes is always scheduled for that bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerInput {
    Demand(DemandSignal),
    BarClosed(Bar),
}

/// One completed computation cycle, ready for fan-out.
///
/// Produced once per bar-close per (symbol, timeframe) after every key
/// scheduled for that bar finished its cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEvent {
    /// The bar whose close triggered the cycle.
    pub bar: Bar,
    /// Keys that were scheduled for this bar.
    pub keys: Vec<IndicatorKey>,
    /// Cached values of `keys` as they stood when the cycle finished. Later
    /// bars of the series may overwrite the cache before fan-out.
    pub values: HashMap<IndicatorKey, ComputedValue>,
}

impl DeliveryEvent {
    pub fn symbol(&self) -> &Symbol {
        &self.bar.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.bar.timeframe
    }
}
