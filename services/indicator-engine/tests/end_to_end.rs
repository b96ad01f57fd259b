//! End-to-end tests for the indicator engine
//!
//! Drives a full engine (ingestion, scheduler, router, sweeper) through its
//! public API with in-memory collaborators and channel transports.
//!
//! Tests include:
//! - Session isolation on a shared series
//! - Compute-once under concurrent subscribes
//! - Heartbeat expiry releasing keys
//! - Bar order across a quiet gap
//! - Late subscribers on a derived timeframe

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicator_engine::candles::{Bar, Timeframe};
use indicator_engine::config::EngineConfig;
use indicator_engine::delivery::ChannelTransport;
use indicator_engine::events::Tick;
use indicator_engine::indicators::{Indicator, IndicatorError, IndicatorRegistry, ParamSpec, Payload};
use indicator_engine::key::{IndicatorKey, IndicatorSpec};
use indicator_engine::store::InMemoryBarStore;
use indicator_engine::{Collaborators, Engine};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use types::ids::{SessionId, Symbol, UserId};
use types::time::{now_nanos, secs_to_nanos, NANOS_PER_SEC};

/// 2024-01-02T09:00:00Z
const NINE_AM: i64 = 1_704_186_000 * NANOS_PER_SEC;
const MINUTE: i64 = 60 * NANOS_PER_SEC;

fn sym() -> Symbol {
    Symbol::try_new("SYM").unwrap()
}

fn sid(id: &str) -> SessionId {
    SessionId::try_new(id).unwrap()
}

fn tick(timestamp: i64, price: i64) -> Tick {
    Tick {
        symbol: sym(),
        price: Decimal::from(price),
        volume: Decimal::ONE,
        timestamp,
    }
}

/// Closed 5m bars ending at 8:55 with a zig-zag close series.
fn history_5m(count: i64) -> Vec<Bar> {
    (1..=count)
        .map(|i| {
            let close = Decimal::from(100 + (i * 7) % 11);
            Bar {
                symbol: sym(),
                timeframe: Timeframe::M5,
                bucket_start: NINE_AM - i * 5 * MINUTE,
                open: close,
                high: close + Decimal::ONE,
                low: close - Decimal::ONE,
                close,
                volume: Decimal::from(10),
                trade_count: 10,
                is_complete: true,
            }
        })
        .collect()
}

async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
    let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .expect("transport closed");
    serde_json::from_str(&raw).unwrap()
}

fn indicator_names(message: &Value) -> Vec<String> {
    message["indicators"]
        .as_object()
        .unwrap()
        .keys()
        .cloned()
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_only_receive_their_indicators() {
    let transport = Arc::new(ChannelTransport::new());
    let store = Arc::new(InMemoryBarStore::default());
    store.seed(history_5m(60));

    let collaborators = Collaborators {
        store,
        ..Collaborators::in_memory(transport.clone())
    };
    let engine = Engine::start(EngineConfig::default(), collaborators).unwrap();

    let (ta, mut rx_a) = transport.connect(16);
    let (tb, mut rx_b) = transport.connect(16);
    engine
        .subscribe(&sid("A"), UserId::new("alice"), ta, &sym(), Timeframe::M5, &[IndicatorSpec::new("RSI").with_param("length", 14)])
        .unwrap();
    engine
        .subscribe(&sid("B"), UserId::new("bob"), tb, &sym(), Timeframe::M5, &[IndicatorSpec::new("SMA").with_param("length", 20)])
        .unwrap();

    // 9:00 through 9:04, then a 9:05 tick closes the 5m bucket
    for minute in 0..=5 {
        engine.on_tick(tick(NINE_AM + minute * MINUTE + 10 * NANOS_PER_SEC, 100 + minute)).await;
    }

    let a = next_json(&mut rx_a).await;
    let b = next_json(&mut rx_b).await;

    assert_eq!(a["type"], "market_update");
    assert_eq!(a["symbol"], "SYM");
    assert_eq!(a["timeframe"], "5m");
    assert_eq!(a["timestamp"], "2024-01-02T09:00:00.000Z");
    assert_eq!(a["ohlcv"]["open"], "100");
    assert_eq!(a["ohlcv"]["close"], "104");
    assert_eq!(indicator_names(&a), vec!["RSI_14"]);
    assert!(a["indicators"]["RSI_14"].is_f64());

    assert_eq!(indicator_names(&b), vec!["SMA_20"]);
    assert!(b["indicators"]["SMA_20"].is_f64());

    assert_eq!(engine.metrics()["computations"], 2);
    // Counted after the transport accepts the message
    wait_until(|| engine.metrics()["deliveries"] == 2).await;
    engine.shutdown();
}

/// Returns the last close and counts its invocations.
struct CountingClose {
    calls: Arc<AtomicUsize>,
}

impl Indicator for CountingClose {
    fn name(&self) -> &'static str {
        "COUNT"
    }

    fn params(&self) -> &'static [ParamSpec] {
        &[]
    }

    fn lookback(&self, _params: &[u32]) -> usize {
        1
    }

    fn compute(&self, window: &[Bar], _params: &[u32]) -> Result<Payload, IndicatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        let last = window.last().ok_or(IndicatorError::InsufficientData {
            required: 1,
            available: 0,
        })?;
        last.close
            .to_f64()
            .map(Payload::Scalar)
            .ok_or(IndicatorError::NonFinite)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribers_share_one_computation() {
    const SESSIONS: usize = 16;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut indicators = IndicatorRegistry::with_defaults();
    indicators.register(Arc::new(CountingClose {
        calls: Arc::clone(&calls),
    }));

    let transport = Arc::new(ChannelTransport::new());
    let mut collaborators = Collaborators::in_memory(transport.clone());
    collaborators.indicators = indicators;
    let engine = Engine::start(EngineConfig::default(), collaborators).unwrap();

    let mut receivers = Vec::new();
    let mut subscribes = Vec::new();
    for i in 0..SESSIONS {
        let (transport_ref, rx) = transport.connect(8);
        receivers.push(rx);
        let engine = Arc::clone(&engine);
        subscribes.push(tokio::spawn(async move {
            engine.subscribe(
                &sid(&format!("s{i}")),
                UserId::anonymous(),
                transport_ref,
                &sym(),
                Timeframe::M1,
                &[IndicatorSpec::new("count")],
            )
        }));
    }
    for handle in subscribes {
        let keys = handle.await.unwrap().unwrap();
        assert_eq!(keys[0].to_string(), "SYM@1m:COUNT");
    }
    let key = IndicatorKey::new(sym(), Timeframe::M1, "COUNT", vec![]);
    assert_eq!(engine.registry().ref_count(&key), SESSIONS);

    engine.on_tick(tick(NINE_AM + 5 * NANOS_PER_SEC, 250)).await;
    engine.on_tick(tick(NINE_AM + MINUTE + 5 * NANOS_PER_SEC, 251)).await;

    let mut values = Vec::new();
    for rx in receivers.iter_mut() {
        let message = next_json(rx).await;
        values.push(message["indicators"]["COUNT"].clone());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| *v == Value::from(250.0)));
    assert!(engine.registry().verify().is_ok());
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quiet_gap_computes_every_bar_in_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut indicators = IndicatorRegistry::with_defaults();
    indicators.register(Arc::new(CountingClose {
        calls: Arc::clone(&calls),
    }));

    let transport = Arc::new(ChannelTransport::new());
    let mut collaborators = Collaborators::in_memory(transport.clone());
    collaborators.indicators = indicators;
    let engine = Engine::start(EngineConfig::default(), collaborators).unwrap();

    let (transport_ref, mut rx) = transport.connect(16);
    engine
        .subscribe(&sid("gap"), UserId::anonymous(), transport_ref, &sym(), Timeframe::M1, &[IndicatorSpec::new("COUNT")])
        .unwrap();

    // Nothing trades between 9:00 and 9:04, so one tick closes four bars
    engine.on_tick(tick(NINE_AM + NANOS_PER_SEC, 250)).await;
    engine.on_tick(tick(NINE_AM + 4 * MINUTE + NANOS_PER_SEC, 260)).await;

    let mut timestamps = Vec::new();
    for _ in 0..4 {
        let message = next_json(&mut rx).await;
        assert_eq!(message["indicators"]["COUNT"], Value::from(250.0));
        timestamps.push(message["timestamp"].as_str().unwrap().to_string());
    }
    assert_eq!(
        timestamps,
        vec![
            "2024-01-02T09:00:00.000Z",
            "2024-01-02T09:01:00.000Z",
            "2024-01-02T09:02:00.000Z",
            "2024-01-02T09:03:00.000Z",
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(engine.metrics()["lease_contention"], 0);
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_derived_subscriber_uses_base_history() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = Engine::start(EngineConfig::default(), Collaborators::in_memory(transport.clone())).unwrap();

    // An hour of 1m trading with nobody watching
    for minute in 0..60 {
        engine.on_tick(tick(NINE_AM + minute * MINUTE + 10 * NANOS_PER_SEC, 100 + minute)).await;
    }
    wait_until(|| engine.metrics()["ticks_ingested"] == 60).await;

    let (transport_ref, mut rx) = transport.connect(16);
    engine
        .subscribe(&sid("late"), UserId::anonymous(), transport_ref, &sym(), Timeframe::M5, &[IndicatorSpec::new("SMA").with_param("length", 2)])
        .unwrap();

    // 10:00 closes the 9:55 bucket, 10:05 closes the 10:00 bucket
    for minute in 60..=65 {
        engine.on_tick(tick(NINE_AM + minute * MINUTE + 10 * NANOS_PER_SEC, 100 + minute)).await;
    }

    // 5m closes: 154 (9:50), 159 (9:55), 164 (10:00)
    let first = next_json(&mut rx).await;
    assert_eq!(first["timestamp"], "2024-01-02T09:55:00.000Z");
    assert_eq!(first["indicators"]["SMA_2"], Value::from(156.5));

    let second = next_json(&mut rx).await;
    assert_eq!(second["timestamp"], "2024-01-02T10:00:00.000Z");
    assert_eq!(second["indicators"]["SMA_2"], Value::from(161.5));
    assert_eq!(engine.metrics()["data_gaps"], 0);
    engine.shutdown();
}

#[tokio::test]
async fn test_silent_session_expires_and_releases_key() {
    let transport = Arc::new(ChannelTransport::new());
    let engine = Engine::start(EngineConfig::default(), Collaborators::in_memory(transport)).unwrap();
    let ttl = engine.config().registry.heartbeat_ttl_secs;

    let keys = engine
        .subscribe(&sid("quiet"), UserId::anonymous(), types::ids::TransportRef::new(1), &sym(), Timeframe::M5, &[IndicatorSpec::new("EMA")])
        .unwrap();
    assert_eq!(engine.registry().ref_count(&keys[0]), 1);

    // Scheduling starts once the scheduler drains the start signal
    wait_until(|| engine.scheduler().scheduled_keys(&sym(), Timeframe::M5).len() == 1).await;

    let report = engine.sweeper().sweep(now_nanos() + secs_to_nanos(ttl + 1));
    assert_eq!(report.expired_sessions, vec![sid("quiet")]);
    assert_eq!(engine.registry().ref_count(&keys[0]), 0);

    wait_until(|| engine.scheduler().scheduled_keys(&sym(), Timeframe::M5).is_empty()).await;

    let err = engine.heartbeat(&sid("quiet")).unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
    assert_eq!(engine.metrics()["sessions_expired"], 1);
    engine.shutdown();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}
