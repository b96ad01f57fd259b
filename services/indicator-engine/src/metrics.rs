//! Observability counters for the indicator engine
//!
//! Lock-free counters for every pipeline stage plus a bounded compute-latency
//! window. Exported as a sorted map so `/v1/metrics` output is stable.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Engine-wide metrics.
pub struct EngineMetrics {
    // Ingestion
    pub ticks_ingested: AtomicU64,
    pub ticks_rejected: AtomicU64,
    pub bars_closed: AtomicU64,

    // Computation
    pub computations: AtomicU64,
    pub computation_failures: AtomicU64,
    pub data_gaps: AtomicU64,
    pub lease_contention: AtomicU64,
    pub cache_rechecks_hit: AtomicU64,
    pub results_discarded: AtomicU64,
    pub compute_latency_ns: Mutex<LatencyTracker>,

    // Delivery
    pub deliveries: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub backpressure_notices: AtomicU64,
    pub send_failures: AtomicU64,

    // Lifecycle
    pub sessions_expired: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_ingested: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            bars_closed: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            computation_failures: AtomicU64::new(0),
            data_gaps: AtomicU64::new(0),
            lease_contention: AtomicU64::new(0),
            cache_rechecks_hit: AtomicU64::new(0),
            results_discarded: AtomicU64::new(0),
            compute_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            deliveries: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            backpressure_notices: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one executed computation.
    pub fn record_computation(&self, latency_ns: u64) {
        self.computations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.compute_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_expired(&self, count: usize) {
        self.sessions_expired
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("ticks_ingested", &self.ticks_ingested),
            ("ticks_rejected", &self.ticks_rejected),
            ("bars_closed", &self.bars_closed),
            ("computations", &self.computations),
            ("computation_failures", &self.computation_failures),
            ("data_gaps", &self.data_gaps),
            ("lease_contention", &self.lease_contention),
            ("cache_rechecks_hit", &self.cache_rechecks_hit),
            ("results_discarded", &self.results_discarded),
            ("deliveries", &self.deliveries),
            ("messages_dropped", &self.messages_dropped),
            ("backpressure_notices", &self.backpressure_notices),
            ("send_failures", &self.send_failures),
            ("sessions_expired", &self.sessions_expired),
        ];
        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, c)| (name.to_string(), c.load(Ordering::Relaxed)))
            .collect();

        if let Ok(tracker) = self.compute_latency_ns.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("compute_latency_p50_ns".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("compute_latency_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a latency sample, evicting the oldest when full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Average latency.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
