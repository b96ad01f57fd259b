//! Shared computation across workers
//!
//! Two schedulers with distinct worker ids share one lease store, cache and
//! bar store, the way two engine replicas would share networked ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicator_engine::cache::ResultCache;
use indicator_engine::candles::{Bar, Timeframe};
use indicator_engine::config::{RegistryConfig, SchedulerConfig};
use indicator_engine::events::DemandSignal;
use indicator_engine::indicators::{Indicator, IndicatorError, IndicatorRegistry, ParamSpec, Payload};
use indicator_engine::key::{IndicatorKey, IndicatorSpec};
use indicator_engine::lease::{InMemoryLeaseStore, LeaseStore};
use indicator_engine::metrics::EngineMetrics;
use indicator_engine::registry::SubscriptionRegistry;
use indicator_engine::scheduler::{ComputationScheduler, CycleOutcome, SchedulerDeps};
use indicator_engine::store::InMemoryBarStore;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use types::ids::{SessionId, Symbol, TransportRef, UserId};
use types::time::{now_nanos, NANOS_PER_SEC};

const MINUTE: i64 = 60 * NANOS_PER_SEC;

struct SlowCount {
    calls: Arc<AtomicUsize>,
}

impl Indicator for SlowCount {
    fn name(&self) -> &'static str {
        "SLOWCOUNT"
    }

    fn params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn lookback(&self, _params: &[u32]) -> usize {
        1
    }

    fn compute(&self, _window: &[Bar], _params: &[u32]) -> Result<Payload, IndicatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(Payload::Scalar(42.0))
    }
}

fn sym() -> Symbol {
    Symbol::try_new("SYM").unwrap()
}

fn bar(minute: i64) -> Bar {
    Bar {
        symbol: sym(),
        timeframe: Timeframe::M1,
        bucket_start: minute * MINUTE,
        open: Decimal::from(10),
        high: Decimal::from(10),
        low: Decimal::from(10),
        close: Decimal::from(10),
        volume: Decimal::ONE,
        trade_count: 1,
        is_complete: true,
    }
}

struct Cluster {
    workers: Vec<Arc<ComputationScheduler>>,
    cache: Arc<ResultCache>,
    metrics: Arc<EngineMetrics>,
    calls: Arc<AtomicUsize>,
    key: IndicatorKey,
}

fn cluster(workers: usize) -> Cluster {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut indicators = IndicatorRegistry::with_defaults();
    indicators.register(Arc::new(SlowCount {
        calls: Arc::clone(&calls),
    }));
    let indicators = Arc::new(indicators);

    let (signals, _) = mpsc::unbounded_channel();
    let registry = Arc::new(SubscriptionRegistry::new(
        Arc::clone(&indicators),
        signals,
        RegistryConfig::default(),
        Timeframe::M1,
    ));
    let key = registry
        .subscribe(
            &SessionId::try_new("s1").unwrap(),
            UserId::anonymous(),
            TransportRef::new(1),
            &sym(),
            Timeframe::M1,
            &[IndicatorSpec::new("SLOWCOUNT")],
            now_nanos(),
        )
        .unwrap()
        .remove(0);

    let store = Arc::new(InMemoryBarStore::default());
    store.seed((0..5).map(bar));
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let cache = Arc::new(ResultCache::new());
    let metrics = Arc::new(EngineMetrics::new());

    let deps = SchedulerDeps {
        registry,
        indicators,
        cache: Arc::clone(&cache),
        leases,
        store,
        metrics: Arc::clone(&metrics),
    };
    let workers = (0..workers)
        .map(|_| {
            let worker = Arc::new(ComputationScheduler::new(
                SchedulerConfig::default(),
                Duration::from_secs(10),
                deps.clone(),
            ));
            worker.apply(DemandSignal::Start(key.clone()));
            worker
        })
        .collect();

    Cluster {
        workers,
        cache,
        metrics,
        calls,
        key,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_compute_once_per_bar() {
    let cluster = cluster(2);
    assert_ne!(cluster.workers[0].worker_id(), cluster.workers[1].worker_id());

    let closed = bar(4);
    let (first, second) = tokio::join!(
        cluster.workers[0].on_bar_closed(closed.clone()),
        cluster.workers[1].on_bar_closed(closed.clone()),
    );
    assert_eq!(first.unwrap().keys, vec![cluster.key.clone()]);
    assert_eq!(second.unwrap().keys, vec![cluster.key.clone()]);

    assert_eq!(cluster.calls.load(Ordering::SeqCst), 1);
    let value = cluster.cache.get(&cluster.key, now_nanos()).unwrap();
    assert!(value.is_fresh_for(closed.bucket_start));
    assert_eq!(value.payload, Payload::Scalar(42.0));
    assert_eq!(cluster.metrics.export()["computations"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_worker_receives_holders_value() {
    let cluster = cluster(2);
    let closed = bar(4);

    let holder = Arc::clone(&cluster.workers[0]);
    let key = cluster.key.clone();
    let bar = closed.clone();
    let computing = tokio::spawn(async move { holder.run_cycle(&key, &bar).await });

    // Let the holder take the lease before the second worker tries
    tokio::time::sleep(Duration::from_millis(30)).await;
    let outcome = cluster.workers[1].run_cycle(&cluster.key, &closed).await;

    assert_eq!(outcome, CycleOutcome::Contended { received: true });
    assert_eq!(computing.await.unwrap(), CycleOutcome::Computed);
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.metrics.export()["lease_contention"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_next_bar_recomputes() {
    let cluster = cluster(1);
    let worker = &cluster.workers[0];

    assert_eq!(worker.run_cycle(&cluster.key, &bar(3)).await, CycleOutcome::Computed);
    // Same bar again is served from the cache
    assert_eq!(worker.run_cycle(&cluster.key, &bar(3)).await, CycleOutcome::CacheHit);
    assert_eq!(worker.run_cycle(&cluster.key, &bar(4)).await, CycleOutcome::Computed);
    assert_eq!(cluster.calls.load(Ordering::SeqCst), 2);
}
