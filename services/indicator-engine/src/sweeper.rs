//! Periodic cleanup of expired sessions and cache entries

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use types::ids::SessionId;
use types::time::now_nanos;

use crate::cache::ResultCache;
use crate::delivery::DeliveryRouter;
use crate::metrics::EngineMetrics;
use crate::registry::SubscriptionRegistry;

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: Vec<SessionId>,
    pub evicted_values: usize,
}

pub struct InactivitySweeper {
    registry: Arc<SubscriptionRegistry>,
    router: Arc<DeliveryRouter>,
    cache: Arc<ResultCache>,
    metrics: Arc<EngineMetrics>,
    interval: Duration,
}

impl InactivitySweeper {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        router: Arc<DeliveryRouter>,
        cache: Arc<ResultCache>,
        metrics: Arc<EngineMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            cache,
            metrics,
            interval,
        }
    }

    /// Expire stale and degraded sessions, drop their outboxes and evict
    /// expired cache values.
    ///
    /// Expiring a session releases its keys, which stops computation for any
    /// key it was the last holder of.
    pub fn sweep(&self, now: i64) -> SweepReport {
        let expired_sessions = self.registry.expire(now);
        for session_id in &expired_sessions {
            self.router.remove_session(session_id);
        }
        self.metrics.record_expired(expired_sessions.len());

        let evicted_values = self.cache.sweep_expired(now);
        if !expired_sessions.is_empty() || evicted_values > 0 {
            info!(
                sessions = expired_sessions.len(),
                values = evicted_values,
                "Sweep removed expired state"
            );
        }
        SweepReport {
            expired_sessions,
            evicted_values,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(interval = ?self.interval, "Sweeper started");
        loop {
            ticker.tick().await;
            self.sweep(now_nanos());
        }
    }
}
