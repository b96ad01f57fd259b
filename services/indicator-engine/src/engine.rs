//! Engine assembly
//!
//! Builds every component from an [`EngineConfig`], connects them with
//! channels and owns their background tasks. Ticks for one symbol are
//! processed in arrival order by that symbol's ingestion task; symbols are
//! independent of each other.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::{SessionId, Symbol, TransportRef, UserId};
use types::time::now_nanos;

use crate::cache::ResultCache;
use crate::candles::{Timeframe, TimeframeAggregator};
use crate::config::{ConfigError, EngineConfig};
use crate::delivery::{DeliveryRouter, Transport};
use crate::error::EngineError;
use crate::events::{SchedulerInput, Tick};
use crate::indicators::IndicatorRegistry;
use crate::key::{IndicatorKey, IndicatorSpec};
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::metrics::EngineMetrics;
use crate::registry::{Selection, Subscription, SubscriptionRegistry};
use crate::scheduler::{ComputationScheduler, SchedulerDeps};
use crate::store::{BarStore, InMemoryBarStore};
use crate::sweeper::InactivitySweeper;
use crate::websocket::{ClientRequest, ServerMessage};

const DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// External collaborators the engine runs against.
pub struct Collaborators {
    pub store: Arc<dyn BarStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub transport: Arc<dyn Transport>,
    pub indicators: IndicatorRegistry,
}

impl Collaborators {
    /// In-process store and leases with the built-in indicators.
    pub fn in_memory(transport: Arc<dyn Transport>) -> Self {
        Self {
            store: Arc::new(InMemoryBarStore::default()),
            leases: Arc::new(InMemoryLeaseStore::new()),
            transport,
            indicators: IndicatorRegistry::with_defaults(),
        }
    }
}

/// Everything a symbol's ingestion task needs.
#[derive(Clone)]
struct IngestContext {
    base: Timeframe,
    max_history: usize,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn BarStore>,
    scheduler: mpsc::UnboundedSender<SchedulerInput>,
    metrics: Arc<EngineMetrics>,
}

pub struct Engine {
    config: EngineConfig,
    indicators: Arc<IndicatorRegistry>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<ResultCache>,
    scheduler: Arc<ComputationScheduler>,
    router: Arc<DeliveryRouter>,
    sweeper: Arc<InactivitySweeper>,
    metrics: Arc<EngineMetrics>,
    ingest: IngestContext,
    symbols: DashMap<Symbol, mpsc::Sender<Tick>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config`, build the components and spawn the scheduler,
    /// router and sweeper tasks. Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let Collaborators {
            store,
            leases,
            transport,
            indicators,
        } = collaborators;
        let indicators = Arc::new(indicators);
        let metrics = Arc::new(EngineMetrics::new());
        let cache = Arc::new(ResultCache::new());

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);

        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&indicators),
            scheduler_tx.clone(),
            config.registry.clone(),
            config.aggregator.base_timeframe,
        ));
        let scheduler = Arc::new(ComputationScheduler::new(
            config.scheduler.clone(),
            Duration::from_secs(config.cache.min_ttl_secs),
            SchedulerDeps {
                registry: Arc::clone(&registry),
                indicators: Arc::clone(&indicators),
                cache: Arc::clone(&cache),
                leases,
                store: Arc::clone(&store),
                metrics: Arc::clone(&metrics),
            },
        )
        .with_base_timeframe(config.aggregator.base_timeframe));
        let router = Arc::new(DeliveryRouter::new(
            config.delivery.clone(),
            Arc::clone(&registry),
            Arc::clone(&cache),
            transport,
            Arc::clone(&metrics),
        ));
        let sweeper = Arc::new(InactivitySweeper::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            Duration::from_secs(config.sweeper.interval_secs),
        ));

        let tasks = vec![
            tokio::spawn(Arc::clone(&scheduler).run(scheduler_rx, delivery_tx)),
            tokio::spawn(Arc::clone(&router).run(delivery_rx)),
            tokio::spawn(Arc::clone(&sweeper).run()),
        ];

        info!(
            worker_id = %scheduler.worker_id(),
            base_timeframe = %config.aggregator.base_timeframe,
            indicators = ?indicators.names(),
            "Indicator engine started"
        );

        let ingest = IngestContext {
            base: config.aggregator.base_timeframe,
            max_history: config.aggregator.max_history,
            registry: Arc::clone(&registry),
            store,
            scheduler: scheduler_tx,
            metrics: Arc::clone(&metrics),
        };

        Ok(Arc::new(Self {
            config,
            indicators,
            registry,
            cache,
            scheduler,
            router,
            sweeper,
            metrics,
            ingest,
            symbols: DashMap::new(),
            tasks: Mutex::new(tasks),
        }))
    }

    /// Feed one raw tick. Waits when the symbol's queue is full.
    pub async fn on_tick(&self, tick: Tick) {
        let sender = self
            .symbols
            .entry(tick.symbol.clone())
            .or_insert_with(|| self.spawn_symbol(tick.symbol.clone()))
            .value()
            .clone();

        if let Err(mpsc::error::SendError(tick)) = sender.send(tick).await {
            warn!(symbol = %tick.symbol, "Ingestion task gone, tick dropped");
            self.symbols.remove(&tick.symbol);
        }
    }

    fn spawn_symbol(&self, symbol: Symbol) -> mpsc::Sender<Tick> {
        let (tx, rx) = mpsc::channel(self.config.aggregator.symbol_queue_capacity.max(1));
        let handle = tokio::spawn(ingest_symbol(symbol.clone(), rx, self.ingest.clone()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        info!(symbol = %symbol, "Ingestion started for symbol");
        tx
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        user_id: UserId,
        transport: TransportRef,
        symbol: &Symbol,
        timeframe: Timeframe,
        specs: &[IndicatorSpec],
    ) -> Result<Vec<IndicatorKey>, EngineError> {
        self.registry
            .subscribe(session_id, user_id, transport, symbol, timeframe, specs, now_nanos())
    }

    pub fn unsubscribe(
        &self,
        session_id: &SessionId,
        selection: Selection,
    ) -> Result<Vec<IndicatorKey>, EngineError> {
        let all = selection == Selection::All;
        let removed = self.registry.unsubscribe(session_id, selection, now_nanos())?;
        if all {
            self.router.remove_session(session_id);
        }
        Ok(removed)
    }

    /// Remove every session still bound to a closed connection, releasing
    /// its keys. Sessions that rebound to another connection are kept.
    pub fn disconnect(&self, transport: TransportRef) -> Vec<SessionId> {
        let sessions = self.registry.sessions_on(transport);
        for session_id in &sessions {
            if let Err(e) = self.unsubscribe(session_id, Selection::All) {
                debug!(session_id = %session_id, error = %e, "Session already gone on disconnect");
            }
        }
        if !sessions.is_empty() {
            info!(transport = %transport, sessions = sessions.len(), "Released sessions of closed connection");
        }
        sessions
    }

    pub fn heartbeat(&self, session_id: &SessionId) -> Result<(), EngineError> {
        self.registry.heartbeat(session_id, now_nanos())
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Result<Subscription, EngineError> {
        self.registry.snapshot(session_id)
    }

    /// Apply a client request and build its reply.
    pub fn handle_request(&self, request: ClientRequest, transport: TransportRef) -> ServerMessage {
        match request {
            ClientRequest::Subscribe {
                session_id,
                user_id,
                symbol,
                timeframe,
                indicators,
            } => match self.subscribe(
                &session_id,
                user_id.unwrap_or_default(),
                transport,
                &symbol,
                timeframe,
                &indicators,
            ) {
                Ok(keys) => ServerMessage::subscribed(session_id, &keys),
                Err(e) => ServerMessage::error(&e),
            },
            ClientRequest::Unsubscribe {
                session_id,
                symbol,
                timeframe,
                indicators,
            } => {
                let selection = match self.selection(&session_id, symbol, timeframe, indicators) {
                    Ok(selection) => selection,
                    Err(reply) => return reply,
                };
                match self.unsubscribe(&session_id, selection) {
                    Ok(keys) => ServerMessage::unsubscribed(session_id, &keys),
                    Err(e) => ServerMessage::error(&e),
                }
            }
            ClientRequest::Heartbeat { session_id } => match self.heartbeat(&session_id) {
                Ok(()) => ServerMessage::HeartbeatAck { session_id },
                Err(e) => ServerMessage::error(&e),
            },
        }
    }

    /// Keys an unsubscribe request names.
    fn selection(
        &self,
        session_id: &SessionId,
        symbol: Option<Symbol>,
        timeframe: Option<Timeframe>,
        indicators: Option<Vec<IndicatorSpec>>,
    ) -> Result<Selection, ServerMessage> {
        let (symbol, timeframe) = match (symbol, timeframe) {
            (Some(symbol), Some(timeframe)) => (symbol, timeframe),
            (None, None) if indicators.is_none() => return Ok(Selection::All),
            _ => {
                return Err(ServerMessage::bad_request(
                    "unsubscribe by indicator requires both symbol and timeframe",
                ))
            }
        };

        match indicators {
            Some(specs) => specs
                .iter()
                .map(|spec| {
                    self.indicators
                        .resolve(spec)
                        .map(|(name, params)| IndicatorKey::new(symbol.clone(), timeframe, name, params))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Selection::Keys)
                .map_err(|e| ServerMessage::error(&e)),
            // Unknown and expired sessions fall through to the registry
            None => Ok(Selection::Keys(
                self.registry
                    .snapshot(session_id)
                    .map(|s| s.keys.into_iter().filter(|k| k.is_on(&symbol, timeframe)).collect())
                    .unwrap_or_default(),
            )),
        }
    }

    /// Counters plus current gauges.
    pub fn metrics(&self) -> BTreeMap<String, u64> {
        let mut out = self.metrics.export();
        let gauges = [
            ("sessions_active", self.registry.session_count()),
            ("cache_entries", self.cache.len()),
            ("lagging_sessions", self.router.lagging_sessions()),
            ("outboxes", self.router.outbox_count()),
            ("symbols", self.symbols.len()),
        ];
        for (name, value) in gauges {
            out.insert(name.to_string(), value as u64);
        }
        out
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<ComputationScheduler> {
        &self.scheduler
    }

    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    pub fn sweeper(&self) -> &Arc<InactivitySweeper> {
        &self.sweeper
    }

    /// Stop ingestion and every background task.
    pub fn shutdown(&self) {
        self.symbols.clear();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        info!(tasks = tasks.len(), "Indicator engine stopped");
    }
}

/// Per-symbol ingestion loop: aggregate, persist, then publish each bar.
async fn ingest_symbol(symbol: Symbol, mut ticks: mpsc::Receiver<Tick>, ctx: IngestContext) {
    let mut aggregator = TimeframeAggregator::new(symbol.clone(), ctx.base, ctx.max_history);

    while let Some(tick) = ticks.recv().await {
        let demanded = ctx.registry.demanded_timeframes(&symbol);
        let bars = match aggregator.on_tick(&tick, &demanded) {
            Ok(bars) => bars,
            Err(rejected) => {
                EngineMetrics::incr(&ctx.metrics.ticks_rejected);
                warn!(symbol = %symbol, error = %rejected, "Tick rejected");
                continue;
            }
        };
        EngineMetrics::incr(&ctx.metrics.ticks_ingested);

        for bar in bars {
            EngineMetrics::incr(&ctx.metrics.bars_closed);
            if let Err(e) = ctx.store.write(&bar).await {
                warn!(symbol = %symbol, timeframe = %bar.timeframe, error = %e, "Failed to persist bar");
            }
            debug!(
                symbol = %symbol,
                timeframe = %bar.timeframe,
                bucket_start = bar.bucket_start,
                close = %bar.close,
                "Bar closed"
            );
            if ctx.scheduler.send(SchedulerInput::BarClosed(bar)).is_err() {
                debug!(symbol = %symbol, "Scheduler gone, bar not scheduled");
            }
        }
    }
    debug!(symbol = %symbol, "Ingestion stopped for symbol");
}
