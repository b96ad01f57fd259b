//! Latest computed value per indicator key
//!
//! Values carry a TTL proportional to their timeframe so that a value stays
//! readable past the next expected bar close. Eviction is lazy on read plus a
//! periodic sweep; a read never returns an expired value.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::{sleep, Instant};
use types::time::now_nanos;

use crate::candles::Timeframe;
use crate::indicators::Payload;
use crate::key::IndicatorKey;

const WAIT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue {
    pub key: IndicatorKey,
    pub payload: Payload,
    /// Bucket start of the bar this value was computed for.
    pub bar_time: i64,
    pub computed_at: i64,
    pub freshness_ttl: Duration,
    /// A later computation for this key failed; the payload is from an
    /// earlier bar.
    pub stale: bool,
}

impl ComputedValue {
    pub fn expires_at(&self) -> i64 {
        let ttl = i64::try_from(self.freshness_ttl.as_nanos()).unwrap_or(i64::MAX);
        self.computed_at.saturating_add(ttl)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }

    /// Fresh for the bar starting at `bar_time`.
    pub fn is_fresh_for(&self, bar_time: i64) -> bool {
        !self.stale && self.bar_time == bar_time
    }
}

/// Twice the timeframe, floored at `min`.
pub fn ttl_for(timeframe: Timeframe, min: Duration) -> Duration {
    let two_bars = Duration::from_secs(timeframe.duration_secs().unsigned_abs() * 2);
    two_bars.max(min)
}

#[derive(Debug, Default)]
pub struct ResultCache {
    values: DashMap<IndicatorKey, ComputedValue>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IndicatorKey, now: i64) -> Option<ComputedValue> {
        if let Some(value) = self.values.get(key) {
            if !value.is_expired(now) {
                return Some(value.value().clone());
            }
        }
        self.values.remove_if(key, |_, v| v.is_expired(now));
        None
    }

    /// Store a value unless a value for a later bar is already cached.
    pub fn put(&self, value: ComputedValue) {
        self.values
            .entry(value.key.clone())
            .and_modify(|current| {
                if current.bar_time <= value.bar_time {
                    *current = value.clone();
                }
            })
            .or_insert(value);
    }

    pub fn invalidate(&self, key: &IndicatorKey) -> bool {
        self.values.remove(key).is_some()
    }

    /// Flag the cached value as stale, keeping its payload.
    pub fn mark_stale(&self, key: &IndicatorKey) -> bool {
        match self.values.get_mut(key) {
            Some(mut value) => {
                value.stale = true;
                true
            }
            None => false,
        }
    }

    /// Drop every expired value. Returns how many were dropped.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.values.len())
    }

    /// Poll until a fresh value for `bar_time` appears or `timeout` passes.
    pub async fn wait_for(
        &self,
        key: &IndicatorKey,
        bar_time: i64,
        timeout: Duration,
    ) -> Option<ComputedValue> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.get(key, now_nanos()) {
                if value.is_fresh_for(bar_time) {
                    return Some(value);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(WAIT_POLL).await;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
