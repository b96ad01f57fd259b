//! Computation scheduler
//!
//! Keeps the set of keys to compute per (symbol, timeframe), driven by the
//! registry's start/stop signals, and runs one computation cycle per key on
//! every bar close:
//!
//! ```text
//! ref_count > 0? ─► acquire lease ─► cache fresh? ─► fetch window ─► compute ─► renew ─► cache
//!                        │ held elsewhere
//!                        └─► wait (bounded) for the holder's value
//! ```
//!
//! A cycle never fails the bar: errors are isolated to their key, logged,
//! and surface to clients as stale or unavailable values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use types::ids::{Symbol, WorkerId};
use types::time::now_nanos;

use crate::cache::{ttl_for, ComputedValue, ResultCache};
use crate::candles::{resample, Bar, Timeframe};
use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::events::{DeliveryEvent, DemandSignal, SchedulerInput};
use crate::indicators::IndicatorRegistry;
use crate::key::IndicatorKey;
use crate::lease::{ComputationLease, LeaseStore};
use crate::metrics::EngineMetrics;
use crate::registry::SubscriptionRegistry;
use crate::store::{BarStore, StoreError};

/// What happens to a computation whose last subscriber left mid-flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Cache the result for sessions that resubscribe before TTL expiry.
    #[default]
    Finish,
    /// Drop the result.
    Discard,
}

/// Result of one key's cycle for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Computed,
    /// Another cycle already cached a value for this bar.
    CacheHit,
    /// Another worker holds the lease; `received` if its value arrived in time.
    Contended { received: bool },
    /// No subscribers left when the cycle started.
    Unsubscribed,
    DataGap,
    Failed,
    /// Computed, but dropped by the in-flight policy or a lost lease.
    Discarded,
}

/// One bar close and the keys scheduled for it when it arrived.
type LaneJob = (Bar, Vec<IndicatorKey>);

/// Poll interval while an earlier cycle of this worker holds a key's lease.
const SELF_HELD_POLL: Duration = Duration::from_millis(5);

/// Shared collaborators of the scheduler.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub registry: Arc<SubscriptionRegistry>,
    pub indicators: Arc<IndicatorRegistry>,
    pub cache: Arc<ResultCache>,
    pub leases: Arc<dyn LeaseStore>,
    pub store: Arc<dyn BarStore>,
    pub metrics: Arc<EngineMetrics>,
}

pub struct ComputationScheduler {
    schedule: Mutex<HashMap<(Symbol, Timeframe), BTreeSet<IndicatorKey>>>,
    deps: SchedulerDeps,
    pool: Arc<Semaphore>,
    worker_id: WorkerId,
    config: SchedulerConfig,
    cache_min_ttl: Duration,
    base: Timeframe,
}

impl ComputationScheduler {
    pub fn new(config: SchedulerConfig, cache_min_ttl: Duration, deps: SchedulerDeps) -> Self {
        let worker_id = WorkerId::new();
        info!(%worker_id, pool = config.worker_pool_size, "Computation scheduler created");
        Self {
            schedule: Mutex::new(HashMap::new()),
            deps,
            pool: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            worker_id,
            config,
            cache_min_ttl,
            base: Timeframe::M1,
        }
    }

    /// Granularity of the stored base bars that derived windows fall back to.
    pub fn with_base_timeframe(mut self, base: Timeframe) -> Self {
        self.base = base;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn schedule(&self) -> MutexGuard<'_, HashMap<(Symbol, Timeframe), BTreeSet<IndicatorKey>>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start or stop scheduling a key. Never touches in-flight cycles.
    pub fn apply(&self, signal: DemandSignal) {
        let mut schedule = self.schedule();
        match signal {
            DemandSignal::Start(key) => {
                debug!(key = %key, "Scheduling key");
                schedule
                    .entry((key.symbol.clone(), key.timeframe))
                    .or_default()
                    .insert(key);
            }
            DemandSignal::Stop(key) => {
                debug!(key = %key, "Unscheduling key");
                let series = (key.symbol.clone(), key.timeframe);
                if let Some(keys) = schedule.get_mut(&series) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        schedule.remove(&series);
                    }
                }
            }
        }
    }

    pub fn scheduled_keys(&self, symbol: &Symbol, timeframe: Timeframe) -> Vec<IndicatorKey> {
        self.schedule()
            .get(&(symbol.clone(), timeframe))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drive the scheduler from its input queue, sending one delivery event
    /// per bar close with scheduled keys.
    ///
    /// Bars of one symbol run strictly one after another on that symbol's
    /// lane; different symbols run in parallel.
    pub async fn run(
        self: Arc<Self>,
        mut inputs: mpsc::UnboundedReceiver<SchedulerInput>,
        deliveries: mpsc::Sender<DeliveryEvent>,
    ) {
        info!(worker_id = %self.worker_id, "Computation scheduler started");
        let mut lanes: HashMap<Symbol, mpsc::UnboundedSender<LaneJob>> = HashMap::new();
        while let Some(input) = inputs.recv().await {
            match input {
                SchedulerInput::Demand(signal) => self.apply(signal),
                SchedulerInput::BarClosed(bar) => {
                    // Snapshot now so demand queued before this bar applies to it
                    let keys = self.scheduled_keys(&bar.symbol, bar.timeframe);
                    if keys.is_empty() {
                        continue;
                    }
                    let lane = lanes
                        .entry(bar.symbol.clone())
                        .or_insert_with(|| self.spawn_lane(bar.symbol.clone(), deliveries.clone()));
                    if let Err(mpsc::error::SendError((bar, _))) = lane.send((bar, keys)) {
                        warn!(symbol = %bar.symbol, "Scheduler lane gone, bar dropped");
                        lanes.remove(&bar.symbol);
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Computation scheduler stopped");
    }

    fn spawn_lane(
        self: &Arc<Self>,
        symbol: Symbol,
        deliveries: mpsc::Sender<DeliveryEvent>,
    ) -> mpsc::UnboundedSender<LaneJob> {
        let (tx, mut jobs) = mpsc::unbounded_channel::<LaneJob>();
        let this = Arc::clone(self);
        debug!(symbol = %symbol, "Scheduler lane started");
        tokio::spawn(async move {
            while let Some((bar, keys)) = jobs.recv().await {
                let event = this.run_bar(bar, keys).await;
                if deliveries.send(event).await.is_err() {
                    debug!(symbol = %symbol, "Delivery queue closed, lane stopping");
                    break;
                }
            }
            debug!(symbol = %symbol, "Scheduler lane stopped");
        });
        tx
    }

    /// Run every scheduled key's cycle for `bar` and wait for all of them.
    pub async fn on_bar_closed(self: &Arc<Self>, bar: Bar) -> Option<DeliveryEvent> {
        let keys = self.scheduled_keys(&bar.symbol, bar.timeframe);
        if keys.is_empty() {
            return None;
        }
        Some(self.run_bar(bar, keys).await)
    }

    async fn run_bar(self: &Arc<Self>, bar: Bar, keys: Vec<IndicatorKey>) -> DeliveryEvent {
        let mut cycles = JoinSet::new();
        for key in keys.iter().cloned() {
            let this = Arc::clone(self);
            let bar = bar.clone();
            cycles.spawn(async move { this.run_cycle(&key, &bar).await });
        }
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                warn!(symbol = %bar.symbol, timeframe = %bar.timeframe, error = %e, "Computation cycle task failed");
            }
        }
        let now = now_nanos();
        let values = keys
            .iter()
            .filter_map(|key| self.deps.cache.get(key, now).map(|v| (key.clone(), v)))
            .collect();
        DeliveryEvent { bar, keys, values }
    }

    /// One key's cycle for one bar.
    pub async fn run_cycle(&self, key: &IndicatorKey, bar: &Bar) -> CycleOutcome {
        if self.deps.registry.ref_count(key) == 0 {
            return CycleOutcome::Unsubscribed;
        }
        let bar_time = bar.bucket_start;

        let Some(mut lease) = self.acquire(key).await else {
            EngineMetrics::incr(&self.deps.metrics.lease_contention);
            debug!(key = %key, bar_time, "Lease held elsewhere, waiting for holder's value");
            let received = self
                .deps
                .cache
                .wait_for(key, bar_time, self.config.contention_wait())
                .await
                .is_some();
            return CycleOutcome::Contended { received };
        };

        let now = now_nanos();
        let fresh = self
            .deps
            .cache
            .get(key, now)
            .is_some_and(|v| v.is_fresh_for(bar_time));
        let outcome = if fresh {
            EngineMetrics::incr(&self.deps.metrics.cache_rechecks_hit);
            debug!(key = %key, bar_time, "Value already cached for bar");
            CycleOutcome::CacheHit
        } else {
            self.compute_under_lease(key, bar, &mut lease).await
        };

        self.deps.leases.release(&lease).await;
        outcome
    }

    /// Take the key's lease. A lease held by an earlier cycle of this same
    /// worker is waited out (bounded by the contention wait) rather than
    /// treated as contention.
    async fn acquire(&self, key: &IndicatorKey) -> Option<ComputationLease> {
        let deadline = Instant::now() + self.config.contention_wait();
        loop {
            let now = now_nanos();
            let acquired = self
                .deps
                .leases
                .try_acquire(key, self.worker_id, self.config.lease_ttl(), now)
                .await;
            if acquired.is_some() {
                return acquired;
            }
            let own = self.deps.leases.holder_of(key, now).await == Some(self.worker_id);
            if !own || Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(SELF_HELD_POLL).await;
        }
    }

    async fn compute_under_lease(
        &self,
        key: &IndicatorKey,
        bar: &Bar,
        lease: &mut ComputationLease,
    ) -> CycleOutcome {
        let Some(indicator) = self.deps.indicators.get(&key.indicator) else {
            return self.fail(key, "indicator not registered".to_string());
        };

        let required = indicator.lookback(&key.params).max(1);
        let fetch = self.fetch_window(key, bar, required);
        let window = match tokio::time::timeout(self.config.fetch_timeout(), fetch).await {
            Err(_) => return self.fail(key, "bar window fetch timed out".to_string()),
            Ok(Err(e)) => return self.fail(key, e.to_string()),
            Ok(Ok(window)) => window,
        };

        let ends_on_bar = window.last().map(|b| b.bucket_start) == Some(bar.bucket_start);
        if window.len() < required || !ends_on_bar {
            let gap = EngineError::DataGap {
                key: key.clone(),
                required,
                available: window.len(),
            };
            EngineMetrics::incr(&self.deps.metrics.data_gaps);
            warn!(error = %gap, "Insufficient history, value unavailable");
            self.deps.cache.invalidate(key);
            return CycleOutcome::DataGap;
        }

        let Ok(permit) = Arc::clone(&self.pool).acquire_owned().await else {
            return self.fail(key, "worker pool closed".to_string());
        };
        let params = key.params.clone();
        let started = Instant::now();
        let computed = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            indicator.compute(&window, &params)
        })
        .await;

        let payload = match computed {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => return self.fail(key, e.to_string()),
            Err(e) if e.is_panic() => return self.fail(key, "compute function panicked".to_string()),
            Err(e) => return self.fail(key, e.to_string()),
        };
        self.deps
            .metrics
            .record_computation(started.elapsed().as_nanos() as u64);

        if self.config.in_flight_policy == InFlightPolicy::Discard
            && self.deps.registry.ref_count(key) == 0
        {
            EngineMetrics::incr(&self.deps.metrics.results_discarded);
            debug!(key = %key, "Last subscriber left mid-computation, result discarded");
            return CycleOutcome::Discarded;
        }

        let now = now_nanos();
        match self.deps.leases.renew(lease, self.config.lease_ttl(), now).await {
            Some(renewed) => *lease = renewed,
            None => {
                EngineMetrics::incr(&self.deps.metrics.results_discarded);
                warn!(key = %key, "Lease expired during computation, result discarded");
                return CycleOutcome::Discarded;
            }
        }

        self.deps.cache.put(ComputedValue {
            key: key.clone(),
            payload,
            bar_time: bar.bucket_start,
            computed_at: now,
            freshness_ttl: ttl_for(key.timeframe, self.cache_min_ttl),
            stale: false,
        });
        debug!(key = %key, bar_time = bar.bucket_start, "Computed");
        CycleOutcome::Computed
    }

    /// The `required` bars of `key.timeframe` ending at `bar`, oldest first.
    ///
    /// Derived buckets missing from the store are rebuilt from stored base
    /// bars and written back, so a timeframe that gained subscribers late
    /// still sees the history its base bars cover.
    async fn fetch_window(
        &self,
        key: &IndicatorKey,
        bar: &Bar,
        required: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        let step = key.timeframe.duration_nanos();
        let range = bar
            .bucket_start
            .saturating_sub(step.saturating_mul(required as i64 - 1))..bar.bucket_end();
        let stored = self
            .deps
            .store
            .read(&key.symbol, key.timeframe, range.clone())
            .await?;

        let complete = stored.len() >= required
            && stored.last().map(|b| b.bucket_start) == Some(bar.bucket_start);
        if complete || key.timeframe == self.base || !key.timeframe.is_derivable_from(self.base) {
            return Ok(stored);
        }

        let base_bars = self
            .deps
            .store
            .read(&key.symbol, self.base, range)
            .await?;
        let per_bucket = key.timeframe.base_bars_per_bucket(self.base);
        let mut buckets: BTreeMap<i64, Vec<Bar>> = BTreeMap::new();
        for base_bar in base_bars {
            buckets
                .entry(key.timeframe.align_to_boundary(base_bar.bucket_start))
                .or_default()
                .push(base_bar);
        }

        let mut window: BTreeMap<i64, Bar> = stored.into_iter().map(|b| (b.bucket_start, b)).collect();
        let mut rebuilt = 0usize;
        for (bucket_start, bars) in buckets {
            if window.contains_key(&bucket_start) || bars.len() != per_bucket {
                continue;
            }
            let Some(derived) = resample(&bars, key.timeframe) else {
                continue;
            };
            self.deps.store.write(&derived).await?;
            window.insert(bucket_start, derived);
            rebuilt += 1;
        }
        if rebuilt > 0 {
            debug!(key = %key, rebuilt, "Rebuilt derived bars from base history");
        }
        Ok(window.into_values().collect())
    }

    /// Isolate a failed cycle: log, count, and flag the previous value stale.
    fn fail(&self, key: &IndicatorKey, reason: String) -> CycleOutcome {
        let err = EngineError::ComputationFailure {
            key: key.clone(),
            reason,
        };
        EngineMetrics::incr(&self.deps.metrics.computation_failures);
        warn!(error = %err, "Computation failed, keeping previous value as stale");
        self.deps.cache.mark_stale(key);
        CycleOutcome::Failed
    }
}
