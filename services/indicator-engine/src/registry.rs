//! Subscription registry
//!
//! Authoritative table of session subscriptions and the reverse index
//! `IndicatorKey → sessions`. All state lives behind one mutex so that a
//! session's key set, the reverse index, the per-symbol timeframe demand and
//! the scheduler start/stop signals always change together.
//!
//! Reference count of a key is the size of its reverse-index entry; it is
//! never stored separately.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use types::ids::{SessionId, Symbol, TransportRef, UserId};
use types::time::secs_to_nanos;

use crate::candles::Timeframe;
use crate::config::RegistryConfig;
use crate::error::EngineError;
use crate::events::{DemandSignal, SchedulerInput};
use crate::indicators::IndicatorRegistry;
use crate::key::{IndicatorKey, IndicatorSpec};

/// One client session's subscription state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub keys: BTreeSet<IndicatorKey>,
    pub transport: TransportRef,
    pub last_heartbeat: i64,
    pub created_at: i64,
    /// Set by the router after repeated send failures.
    pub degraded: bool,
}

/// Which keys an unsubscribe removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every key, and the session record itself.
    All,
    Keys(Vec<IndicatorKey>),
}

/// A session that should receive a delivery, with the keys it holds on the
/// delivered series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub session_id: SessionId,
    pub transport: TransportRef,
    pub keys: Vec<IndicatorKey>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Subscription>,
    index: HashMap<IndicatorKey, BTreeSet<SessionId>>,
    /// Number of live keys per (symbol, timeframe).
    demand: HashMap<Symbol, BTreeMap<Timeframe, usize>>,
    tombstones: VecDeque<SessionId>,
    tombstone_set: HashSet<SessionId>,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    indicators: Arc<IndicatorRegistry>,
    signals: mpsc::UnboundedSender<SchedulerInput>,
    config: RegistryConfig,
    base: Timeframe,
}

impl SubscriptionRegistry {
    pub fn new(
        indicators: Arc<IndicatorRegistry>,
        signals: mpsc::UnboundedSender<SchedulerInput>,
        config: RegistryConfig,
        base: Timeframe,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            indicators,
            signals,
            config,
            base,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `specs`, add the resulting keys to the session (creating it
    /// if absent) and return the confirmed keys in request order.
    ///
    /// Validation failures and limit violations leave the registry untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        user_id: UserId,
        transport: TransportRef,
        symbol: &Symbol,
        timeframe: Timeframe,
        specs: &[IndicatorSpec],
        now: i64,
    ) -> Result<Vec<IndicatorKey>, EngineError> {
        if !timeframe.is_derivable_from(self.base) {
            return Err(EngineError::invalid_spec(
                timeframe.label(),
                format!("timeframe cannot be built from base {}", self.base),
            ));
        }

        let mut keys = Vec::with_capacity(specs.len());
        for spec in specs {
            let (name, params) = self.indicators.resolve(spec)?;
            let key = IndicatorKey::new(symbol.clone(), timeframe, name, params);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut state = self.state();

        let held = state
            .sessions
            .get(session_id)
            .map(|s| s.keys.clone())
            .unwrap_or_default();
        let total = held.len() + keys.iter().filter(|k| !held.contains(*k)).count();
        if total > self.config.max_keys_per_session {
            return Err(EngineError::SubscriptionLimit {
                session_id: session_id.clone(),
                limit: self.config.max_keys_per_session,
            });
        }

        if state.tombstone_set.remove(session_id) {
            state.tombstones.retain(|id| id != session_id);
        }

        let session = state
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                info!(session_id = %session_id, user_id = %user_id, "Session created");
                Subscription {
                    session_id: session_id.clone(),
                    user_id,
                    keys: BTreeSet::new(),
                    transport,
                    last_heartbeat: now,
                    created_at: now,
                    degraded: false,
                }
            });
        session.transport = transport;
        session.last_heartbeat = now;

        let added: Vec<IndicatorKey> = keys
            .iter()
            .filter(|k| session.keys.insert((*k).clone()))
            .cloned()
            .collect();

        for key in added {
            self.index_insert(&mut state, session_id, key);
        }

        debug!(session_id = %session_id, keys = keys.len(), "Subscribed");
        Ok(keys)
    }

    /// Remove keys from a session; returns the keys actually removed.
    ///
    /// Unknown sessions and keys not held are no-ops. A session expired by
    /// the sweeper yields `SessionNotFound`.
    pub fn unsubscribe(
        &self,
        session_id: &SessionId,
        selection: Selection,
        now: i64,
    ) -> Result<Vec<IndicatorKey>, EngineError> {
        let mut state = self.state();

        if state.tombstone_set.contains(session_id) {
            return Err(EngineError::SessionNotFound {
                session_id: session_id.clone(),
            });
        }

        let removed = match selection {
            Selection::All => match state.sessions.remove(session_id) {
                Some(session) => {
                    info!(session_id = %session_id, "Session removed");
                    session.keys.into_iter().collect()
                }
                None => Vec::new(),
            },
            Selection::Keys(keys) => match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.last_heartbeat = now;
                    keys.into_iter()
                        .filter(|k| session.keys.remove(k))
                        .collect()
                }
                None => Vec::new(),
            },
        };

        for key in &removed {
            self.index_remove(&mut state, session_id, key);
        }
        Ok(removed)
    }

    /// Reset the session's expiry timer.
    pub fn heartbeat(&self, session_id: &SessionId, now: i64) -> Result<(), EngineError> {
        let mut state = self.state();
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.last_heartbeat = now;
                Ok(())
            }
            None => Err(EngineError::SessionNotFound {
                session_id: session_id.clone(),
            }),
        }
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Result<Subscription, EngineError> {
        self.state()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.clone(),
            })
    }

    /// Number of sessions currently subscribed to `key`.
    pub fn ref_count(&self, key: &IndicatorKey) -> usize {
        self.state().index.get(key).map_or(0, |s| s.len())
    }

    pub fn subscribers(&self, key: &IndicatorKey) -> Vec<SessionId> {
        self.state()
            .index
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions subscribed to any of `keys`, each with the full set of keys
    /// it currently holds on `symbol`/`timeframe`. Degraded sessions are
    /// skipped.
    pub fn recipients(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        keys: &[IndicatorKey],
    ) -> Vec<Recipient> {
        let state = self.state();
        let mut ids = BTreeSet::new();
        for key in keys {
            if let Some(sessions) = state.index.get(key) {
                ids.extend(sessions.iter());
            }
        }

        ids.into_iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|s| !s.degraded)
            .map(|s| Recipient {
                session_id: s.session_id.clone(),
                transport: s.transport,
                keys: s
                    .keys
                    .iter()
                    .filter(|k| k.is_on(symbol, timeframe))
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    /// Timeframes with at least one live key on `symbol`.
    pub fn demanded_timeframes(&self, symbol: &Symbol) -> Vec<Timeframe> {
        self.state()
            .demand
            .get(symbol)
            .map(|tfs| tfs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sessions currently bound to `transport`.
    pub fn sessions_on(&self, transport: TransportRef) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .state()
            .sessions
            .values()
            .filter(|s| s.transport == transport)
            .map(|s| s.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Flag a session so the sweeper removes it.
    pub fn mark_degraded(&self, session_id: &SessionId) -> bool {
        match self.state().sessions.get_mut(session_id) {
            Some(session) if !session.degraded => {
                session.degraded = true;
                true
            }
            _ => false,
        }
    }

    /// Remove every session whose heartbeat is older than the TTL, or that
    /// is degraded. Returns the removed session ids.
    pub fn expire(&self, now: i64) -> Vec<SessionId> {
        let ttl = secs_to_nanos(self.config.heartbeat_ttl_secs);
        let mut state = self.state();

        let expired: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| s.degraded || now.saturating_sub(s.last_heartbeat) > ttl)
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in &expired {
            let Some(session) = state.sessions.remove(session_id) else {
                continue;
            };
            for key in &session.keys {
                self.index_remove(&mut state, session_id, key);
            }
            self.push_tombstone(&mut state, session_id.clone());
            info!(
                session_id = %session_id,
                degraded = session.degraded,
                keys = session.keys.len(),
                "Session expired"
            );
        }
        expired
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Check `ref_count(k) == |index[k]|` and index/session agreement.
    pub fn verify(&self) -> Result<(), String> {
        let state = self.state();

        for (key, sessions) in &state.index {
            if sessions.is_empty() {
                return Err(format!("empty index entry for {key}"));
            }
            for id in sessions {
                let holds = state
                    .sessions
                    .get(id)
                    .is_some_and(|s| s.keys.contains(key));
                if !holds {
                    return Err(format!("index lists {id} for {key} but session does not hold it"));
                }
            }
        }

        let mut demand: HashMap<(&Symbol, Timeframe), usize> = HashMap::new();
        for session in state.sessions.values() {
            for key in &session.keys {
                let indexed = state
                    .index
                    .get(key)
                    .is_some_and(|s| s.contains(&session.session_id));
                if !indexed {
                    return Err(format!("{} holds {key} but is not indexed", session.session_id));
                }
            }
        }
        for key in state.index.keys() {
            *demand.entry((&key.symbol, key.timeframe)).or_default() += 1;
        }
        for (symbol, tfs) in &state.demand {
            for (tf, count) in tfs {
                if demand.get(&(symbol, *tf)) != Some(count) {
                    return Err(format!("demand for {symbol}@{tf} is {count}, index disagrees"));
                }
            }
        }
        let demand_entries: usize = state.demand.values().map(|t| t.len()).sum();
        if demand_entries != demand.len() {
            return Err("demand table is missing entries".to_string());
        }
        Ok(())
    }

    fn index_insert(&self, state: &mut RegistryState, session_id: &SessionId, key: IndicatorKey) {
        let sessions = state.index.entry(key.clone()).or_default();
        sessions.insert(session_id.clone());
        if sessions.len() == 1 {
            *state
                .demand
                .entry(key.symbol.clone())
                .or_default()
                .entry(key.timeframe)
                .or_default() += 1;
            self.signal(DemandSignal::Start(key));
        }
    }

    fn index_remove(&self, state: &mut RegistryState, session_id: &SessionId, key: &IndicatorKey) {
        let Some(sessions) = state.index.get_mut(key) else {
            return;
        };
        if !sessions.remove(session_id) || !sessions.is_empty() {
            return;
        }
        state.index.remove(key);

        if let Some(tfs) = state.demand.get_mut(&key.symbol) {
            if let Some(count) = tfs.get_mut(&key.timeframe) {
                *count -= 1;
                if *count == 0 {
                    tfs.remove(&key.timeframe);
                }
            }
            if tfs.is_empty() {
                state.demand.remove(&key.symbol);
            }
        }
        self.signal(DemandSignal::Stop(key.clone()));
    }

    fn push_tombstone(&self, state: &mut RegistryState, session_id: SessionId) {
        if self.config.tombstone_capacity == 0 {
            return;
        }
        if state.tombstone_set.insert(session_id.clone()) {
            state.tombstones.push_back(session_id);
        }
        while state.tombstones.len() > self.config.tombstone_capacity {
            if let Some(oldest) = state.tombstones.pop_front() {
                state.tombstone_set.remove(&oldest);
            }
        }
    }

    fn signal(&self, signal: DemandSignal) {
        debug!(key = %signal.key(), start = matches!(signal, DemandSignal::Start(_)), "Demand transition");
        if self.signals.send(SchedulerInput::Demand(signal)).is_err() {
            debug!("Scheduler input closed, demand signal dropped");
        }
    }
}
