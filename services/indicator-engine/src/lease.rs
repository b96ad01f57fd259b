//! Computation leases
//!
//! A lease grants one worker the exclusive right to compute one indicator
//! key until `expires_at`. Leases are never extended implicitly: a holder
//! that stalls past expiry loses the key to the next worker that asks.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use types::ids::WorkerId;

use crate::key::IndicatorKey;

/// Exclusive, self-expiring right to compute `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationLease {
    pub key: IndicatorKey,
    pub holder: WorkerId,
    /// Unix nanoseconds.
    pub expires_at: i64,
}

impl ComputationLease {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Store of computation leases shared by every worker.
///
/// Async so a networked store can back it; the in-memory store never waits.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant a lease unless another holder owns an unexpired one.
    async fn try_acquire(
        &self,
        key: &IndicatorKey,
        holder: WorkerId,
        ttl: Duration,
        now: i64,
    ) -> Option<ComputationLease>;

    /// Extend a lease still owned by its holder. `None` if it was lost.
    async fn renew(&self, lease: &ComputationLease, ttl: Duration, now: i64) -> Option<ComputationLease>;

    /// Give the lease up. Returns false if it was no longer held.
    async fn release(&self, lease: &ComputationLease) -> bool;

    /// Worker holding an unexpired lease on `key`, if any.
    async fn holder_of(&self, key: &IndicatorKey, now: i64) -> Option<WorkerId>;
}

fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX))
}

/// Process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<IndicatorKey, ComputationLease>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease on `key`, expired or not.
    pub fn holder(&self, key: &IndicatorKey) -> Option<ComputationLease> {
        self.leases.get(key).map(|l| l.value().clone())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &IndicatorKey,
        holder: WorkerId,
        ttl: Duration,
        now: i64,
    ) -> Option<ComputationLease> {
        let lease = ComputationLease {
            key: key.clone(),
            holder,
            expires_at: expiry(now, ttl),
        };
        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired(now) {
                    return None;
                }
                existing.insert(lease.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
            }
        }
        Some(lease)
    }

    async fn renew(&self, lease: &ComputationLease, ttl: Duration, now: i64) -> Option<ComputationLease> {
        let mut current = self.leases.get_mut(&lease.key)?;
        if current.holder != lease.holder || current.expires_at != lease.expires_at || current.is_expired(now) {
            return None;
        }
        current.expires_at = expiry(now, ttl);
        Some(current.value().clone())
    }

    async fn release(&self, lease: &ComputationLease) -> bool {
        self.leases
            .remove_if(&lease.key, |_, current| {
                current.holder == lease.holder && current.expires_at == lease.expires_at
            })
            .is_some()
    }

    async fn holder_of(&self, key: &IndicatorKey, now: i64) -> Option<WorkerId> {
        self.leases
            .get(key)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.holder)
    }
}
