use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::backoff::{with_retry, RetryPolicy};
use crate::connection_manager::{ConnectionId, DeviceKey};
use crate::metrics::PresenceMetrics;
use crate::redis::RedisHealth;

use super::memory_store::MemoryPresenceStore;
use super::store::{PresenceStore, PresenceTransition, SetMutation};

/// A mutation the shared store has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Add,
    Remove,
}

/// Folds connection churn into device-level online/offline transitions.
///
/// Every mutation is mirrored into a node-local store. When the shared store
/// keeps failing after retries, the mirror's answer is used instead and the
/// missed write is queued; [`PresenceAggregator::refresh`] replays the queue
/// once the store answers again. A transition is only reported when both the
/// shared store and the mirror agree the device crossed the boundary, so a
/// connection the store never saw cannot hide an offline edge or produce a
/// second online edge.
pub struct PresenceAggregator {
    store: Arc<dyn PresenceStore>,
    mirror: MemoryPresenceStore,
    pending: DashMap<(DeviceKey, ConnectionId), PendingWrite>,
    ttl: Duration,
    retry: RetryPolicy,
    health: Arc<RedisHealth>,
}

impl PresenceAggregator {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        ttl: Duration,
        retry: RetryPolicy,
        health: Arc<RedisHealth>,
    ) -> Self {
        tracing::info!(
            backend = store.backend_name(),
            ttl_secs = ttl.as_secs(),
            "Presence aggregator initialized"
        );
        Self {
            store,
            mirror: MemoryPresenceStore::new(),
            pending: DashMap::new(),
            ttl,
            retry,
            health,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes queued while the shared store was unreachable.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn degraded(&self, operation: &str, error: &dyn std::fmt::Display) {
        tracing::error!(
            operation = %operation,
            backend = self.store.backend_name(),
            error = %error,
            "Presence store unavailable, using node-local presence"
        );
        PresenceMetrics::record_degraded();
        self.health.record_degradation();
    }

    fn record(&self, device: &DeviceKey, transition: PresenceTransition) -> PresenceTransition {
        if let Some(online) = transition.online() {
            PresenceMetrics::record_transition(online);
            tracing::info!(device = %device, online = online, "Device presence changed");
        }
        transition
    }

    pub async fn connection_opened(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
    ) -> PresenceTransition {
        let local = self
            .mirror
            .add_connection(device, connection_id, self.ttl)
            .await
            .unwrap_or(SetMutation { changed: true, cardinality: 1 });

        let shared = with_retry(&self.retry, "presence.add", || {
            self.store.add_connection(device, connection_id, self.ttl)
        })
        .await;

        let transition = match shared {
            // Other local members the store has not seen were already reported
            Ok(_) if local.cardinality > 1 => PresenceTransition::Unchanged,
            Ok(shared) => PresenceTransition::after_add(shared),
            Err(e) => {
                self.degraded("presence.add", &e);
                self.pending
                    .insert((device.clone(), connection_id), PendingWrite::Add);
                PresenceTransition::after_add(local)
            }
        };

        self.record(device, transition)
    }

    pub async fn connection_closed(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
    ) -> PresenceTransition {
        let local = self
            .mirror
            .remove_connection(device, connection_id)
            .await
            .unwrap_or(SetMutation { changed: false, cardinality: 0 });
        let unsynced_add = self
            .pending
            .remove(&(device.clone(), connection_id))
            .is_some();

        let shared = with_retry(&self.retry, "presence.remove", || {
            self.store.remove_connection(device, connection_id)
        })
        .await;

        let transition = match shared {
            Ok(shared) => {
                let removed = shared.changed || local.changed;
                if removed && shared.cardinality == 0 && local.cardinality == 0 {
                    PresenceTransition::WentOffline
                } else {
                    PresenceTransition::Unchanged
                }
            }
            Err(e) => {
                self.degraded("presence.remove", &e);
                if !unsynced_add {
                    self.pending
                        .insert((device.clone(), connection_id), PendingWrite::Remove);
                }
                PresenceTransition::after_remove(local)
            }
        };

        self.record(device, transition)
    }

    /// Replay queued writes against the shared store. Entries that still fail
    /// stay queued for the next round.
    async fn replay_pending(&self) {
        let queued: Vec<_> = self
            .pending
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if queued.is_empty() {
            return;
        }

        let mut replayed = 0usize;
        for ((device, connection_id), write) in queued {
            let result = match write {
                PendingWrite::Add => self
                    .store
                    .add_connection(&device, connection_id, self.ttl)
                    .await
                    .map(|_| ()),
                PendingWrite::Remove => self
                    .store
                    .remove_connection(&device, connection_id)
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {
                    self.pending
                        .remove_if(&(device, connection_id), |_, queued| *queued == write);
                    replayed += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Presence store still unavailable, keeping queued writes");
                    return;
                }
            }
        }
        tracing::info!(replayed, "Replayed queued presence writes");
    }

    pub async fn is_online(&self, device: &DeviceKey) -> bool {
        match with_retry(&self.retry, "presence.count", || {
            self.store.connection_count(device)
        })
        .await
        {
            Ok(count) => count > 0,
            Err(e) => {
                self.degraded("presence.count", &e);
                self.mirror
                    .connection_count(device)
                    .await
                    .map(|c| c > 0)
                    .unwrap_or(false)
            }
        }
    }

    /// Online flags for many devices in one batched lookup, in input order.
    pub async fn online_devices(&self, devices: &[DeviceKey]) -> Vec<bool> {
        let counts = match with_retry(&self.retry, "presence.counts", || {
            self.store.connection_counts(devices)
        })
        .await
        {
            Ok(counts) => counts,
            Err(e) => {
                self.degraded("presence.counts", &e);
                self.mirror
                    .connection_counts(devices)
                    .await
                    .unwrap_or_else(|_| vec![0; devices.len()])
            }
        };
        counts.into_iter().map(|c| c > 0).collect()
    }

    /// Replay writes the shared store missed, then re-stamp the expiry of
    /// this node's connections.
    pub async fn refresh(&self, entries: &[(DeviceKey, ConnectionId)]) {
        self.replay_pending().await;
        if entries.is_empty() {
            return;
        }
        let _ = self.mirror.refresh(entries, self.ttl).await;
        if let Err(e) = with_retry(&self.retry, "presence.refresh", || {
            self.store.refresh(entries, self.ttl)
        })
        .await
        {
            self.degraded("presence.refresh", &e);
        }
    }
}
