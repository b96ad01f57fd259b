//! Delivery router
//!
//! Turns each delivery event into one consolidated `market_update` per
//! interested session, holding only the keys that session subscribes to on
//! the event's series. Messages go through the session's bounded outbox and
//! are written by a per-session task, so a slow client never stalls the
//! router or another session.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use types::ids::{SessionId, TransportRef};
use types::time::now_nanos;

use crate::backpressure::{BackpressureReason, OutboundQueue};
use crate::cache::ResultCache;
use crate::candles::Timeframe;
use crate::config::DeliveryConfig;
use crate::error::EngineError;
use crate::events::DeliveryEvent;
use crate::key::IndicatorKey;
use crate::metrics::EngineMetrics;
use crate::registry::SubscriptionRegistry;
use crate::websocket::{IndicatorField, MarketUpdate, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(TransportRef),

    #[error("connection {0} is not registered")]
    UnknownConnection(TransportRef),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound half of the client transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one serialized message to the connection behind `transport`.
    async fn send(
        &self,
        session_id: &SessionId,
        transport: TransportRef,
        payload: &str,
    ) -> Result<(), TransportError>;
}

/// Transport over in-process channels, one per connection.
///
/// The WebSocket handler registers a connection and forwards whatever it
/// receives to the socket.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    connections: DashMap<TransportRef, mpsc::Sender<String>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with a `buffer`-deep channel.
    pub fn connect(&self, buffer: usize) -> (TransportRef, mpsc::Receiver<String>) {
        let id = TransportRef::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.connections.insert(id, tx);
        debug!(transport = %id, "Connection registered");
        (id, rx)
    }

    pub fn disconnect(&self, transport: TransportRef) {
        if self.connections.remove(&transport).is_some() {
            debug!(transport = %transport, "Connection removed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        _session_id: &SessionId,
        transport: TransportRef,
        payload: &str,
    ) -> Result<(), TransportError> {
        let sender = self
            .connections
            .get(&transport)
            .map(|tx| tx.value().clone())
            .ok_or(TransportError::UnknownConnection(transport))?;
        sender
            .send(payload.to_string())
            .await
            .map_err(|_| TransportError::Closed(transport))
    }
}

#[derive(Debug)]
struct Outgoing {
    transport: TransportRef,
    payload: String,
}

struct Outbox {
    queue: Mutex<OutboundQueue<Outgoing>>,
    notify: Notify,
    consecutive_failures: AtomicU32,
    closed: AtomicBool,
}

impl Outbox {
    fn queue(&self) -> MutexGuard<'_, OutboundQueue<Outgoing>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DeliveryRouter {
    outboxes: DashMap<SessionId, Arc<Outbox>>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<ResultCache>,
    transport: Arc<dyn Transport>,
    metrics: Arc<EngineMetrics>,
    config: DeliveryConfig,
    lagging: AtomicUsize,
}

impl DeliveryRouter {
    pub fn new(
        config: DeliveryConfig,
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<ResultCache>,
        transport: Arc<dyn Transport>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            outboxes: DashMap::new(),
            registry,
            cache,
            transport,
            metrics,
            config,
            lagging: AtomicUsize::new(0),
        }
    }

    /// Fan delivery events out until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DeliveryEvent>) {
        info!("Delivery router started");
        while let Some(event) = events.recv().await {
            self.deliver(&event);
        }
        info!("Delivery router stopped");
    }

    /// Queue one consolidated update per interested session. Returns the
    /// number of sessions queued.
    pub fn deliver(self: &Arc<Self>, event: &DeliveryEvent) -> usize {
        let recipients =
            self.registry
                .recipients(event.symbol(), event.timeframe(), &event.keys);
        if recipients.is_empty() {
            return 0;
        }

        let now = now_nanos();
        let bar_time = event.bar.bucket_start;
        let mut fields: HashMap<IndicatorKey, IndicatorField> = HashMap::new();
        let mut queued = 0;

        for recipient in recipients {
            let indicators: BTreeMap<String, IndicatorField> = recipient
                .keys
                .iter()
                .map(|key| {
                    let field = fields
                        .entry(key.clone())
                        .or_insert_with(|| self.field_for(event, key, bar_time, now))
                        .clone();
                    (key.label(), field)
                })
                .collect();

            let message = ServerMessage::MarketUpdate(MarketUpdate::new(&event.bar, indicators));
            match message.to_json() {
                Ok(payload) => {
                    self.enqueue(&recipient.session_id, recipient.transport, payload, event.timeframe());
                    queued += 1;
                }
                Err(e) => warn!(session_id = %recipient.session_id, error = %e, "Failed to encode market update"),
            }
        }

        debug!(
            symbol = %event.symbol(),
            timeframe = %event.timeframe(),
            bar_time,
            sessions = queued,
            "Delivery fanned out"
        );
        queued
    }

    fn field_for(&self, event: &DeliveryEvent, key: &IndicatorKey, bar_time: i64, now: i64) -> IndicatorField {
        let value = match event.values.get(key) {
            Some(value) => Some(value.clone()),
            None => self.cache.get(key, now),
        };
        match value {
            Some(value) if value.is_fresh_for(bar_time) => IndicatorField::Fresh(value.payload),
            Some(value) => IndicatorField::stale(value.payload),
            None => IndicatorField::unavailable(),
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        session_id: &SessionId,
        transport: TransportRef,
        payload: String,
        timeframe: Timeframe,
    ) {
        let outbox = self.outbox(session_id);
        {
            let mut queue = outbox.queue();
            let outcome = queue.push(Outgoing { transport, payload });
            if outcome.dropped {
                EngineMetrics::incr(&self.metrics.messages_dropped);
            }
            if outcome.lag_onset {
                let lagging = self.lagging.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = BackpressureReason::classify(lagging, self.config.server_load_threshold);
                let notice = ServerMessage::Backpressure {
                    reason,
                    suggested_cadence: reason.suggested_cadence(timeframe),
                };
                if let Ok(payload) = notice.to_json() {
                    queue.push_priority(Outgoing { transport, payload });
                    EngineMetrics::incr(&self.metrics.backpressure_notices);
                }
                info!(
                    session_id = %session_id,
                    reason = ?reason,
                    lagging_sessions = lagging,
                    "Backpressure: session lagging"
                );
            }
        }
        outbox.notify.notify_one();
    }

    fn outbox(self: &Arc<Self>, session_id: &SessionId) -> Arc<Outbox> {
        if let Some(outbox) = self.outboxes.get(session_id) {
            return Arc::clone(outbox.value());
        }
        let entry = self.outboxes.entry(session_id.clone()).or_insert_with(|| {
            let outbox = Arc::new(Outbox {
                queue: Mutex::new(OutboundQueue::new(
                    self.config.queue_capacity,
                    self.config.overflow_policy,
                )),
                notify: Notify::new(),
                consecutive_failures: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            });
            tokio::spawn(Arc::clone(self).write_loop(session_id.clone(), Arc::clone(&outbox)));
            outbox
        });
        Arc::clone(entry.value())
    }

    async fn write_loop(self: Arc<Self>, session_id: SessionId, outbox: Arc<Outbox>) {
        debug!(session_id = %session_id, "Session writer started");
        let timeout = self.config.send_timeout();
        loop {
            if outbox.closed.load(Ordering::Acquire) {
                break;
            }
            let (next, recovered) = outbox.queue().pop();
            if recovered {
                self.lagging.fetch_sub(1, Ordering::Relaxed);
                debug!(session_id = %session_id, "Session caught up");
            }
            let Some(message) = next else {
                outbox.notify.notified().await;
                continue;
            };

            let sent = tokio::time::timeout(
                timeout,
                self.transport.send(&session_id, message.transport, &message.payload),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)));

            match sent {
                Ok(()) => {
                    outbox.consecutive_failures.store(0, Ordering::Relaxed);
                    EngineMetrics::incr(&self.metrics.deliveries);
                }
                Err(e) => self.on_send_failure(&session_id, &outbox, e),
            }
        }
        debug!(session_id = %session_id, "Session writer stopped");
    }

    fn on_send_failure(&self, session_id: &SessionId, outbox: &Outbox, error: TransportError) {
        EngineMetrics::incr(&self.metrics.send_failures);
        let failures = outbox.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let err = EngineError::TransportSendFailure {
            session_id: session_id.clone(),
            reason: error.to_string(),
        };
        warn!(error = %err, consecutive_failures = failures, "Send failed");

        if failures >= self.config.failure_threshold && self.registry.mark_degraded(session_id) {
            warn!(session_id = %session_id, failures, "Session degraded");
        }
    }

    /// Drop a session's outbox and stop its writer.
    pub fn remove_session(&self, session_id: &SessionId) {
        if let Some((_, outbox)) = self.outboxes.remove(session_id) {
            if outbox.queue().clear() {
                self.lagging.fetch_sub(1, Ordering::Relaxed);
            }
            outbox.closed.store(true, Ordering::Release);
            outbox.notify.notify_one();
        }
    }

    pub fn queue_depth(&self, session_id: &SessionId) -> usize {
        self.outboxes
            .get(session_id)
            .map_or(0, |outbox| outbox.queue().len())
    }

    pub fn messages_dropped(&self, session_id: &SessionId) -> u64 {
        self.outboxes
            .get(session_id)
            .map_or(0, |outbox| outbox.queue().messages_dropped())
    }

    pub fn lagging_sessions(&self) -> usize {
        self.lagging.load(Ordering::Relaxed)
    }

    pub fn outbox_count(&self) -> usize {
        self.outboxes.len()
    }
}
