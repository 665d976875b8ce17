use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::stats::{ConnectionStats, TenantConnectionStats};
use super::types::{
    ConnectionError, ConnectionHandle, ConnectionId, ConnectionLimits, DeviceKey, Namespace,
};

/// Tracks every authenticated connection on this node.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// tenant_id -> Set<connection_id>
    tenant_index: DashMap<String, HashSet<ConnectionId>>,
    /// device -> Set<connection_id> (client namespace only)
    device_index: DashMap<DeviceKey, HashSet<ConnectionId>>,
    /// Slots taken against `max_connections`, claimed before insertion
    reserved: AtomicUsize,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            tenant_index: DashMap::new(),
            device_index: DashMap::new(),
            reserved: AtomicUsize::new(0),
            limits,
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Claim one slot of the node-wide limit, or report the current count.
    fn reserve_slot(&self) -> Result<(), usize> {
        let max = self.limits.max_connections;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map(|_| ())
    }

    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }

    /// Register a connection, enforcing node and per-device limits.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), ConnectionError> {
        if let Err(current) = self.reserve_slot() {
            tracing::warn!(
                current = current,
                max = self.limits.max_connections,
                "Total connection limit exceeded"
            );
            return Err(ConnectionError::TotalLimitExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        let conn_id = handle.id;

        if let Some(device) = handle.identity.device_key() {
            // Check and insert under the device entry lock
            let mut device_conns = self.device_index.entry(device.clone()).or_default();
            if device_conns.len() >= self.limits.max_connections_per_device {
                let current = device_conns.len();
                let empty = device_conns.is_empty();
                drop(device_conns);
                if empty {
                    self.device_index.remove_if(&device, |_, c| c.is_empty());
                }
                self.release_slot();
                tracing::warn!(
                    device = %device,
                    current = current,
                    max = self.limits.max_connections_per_device,
                    "Device connection limit exceeded"
                );
                return Err(ConnectionError::DeviceLimitExceeded {
                    device: device.to_string(),
                    current,
                    max: self.limits.max_connections_per_device,
                });
            }
            device_conns.insert(conn_id);
        }

        self.tenant_index
            .entry(handle.identity.tenant_id.clone())
            .or_default()
            .insert(conn_id);
        if self.connections.insert(conn_id, handle.clone()).is_some() {
            // Re-registration of the same id keeps its original slot
            self.release_slot();
        }

        tracing::info!(
            connection_id = %conn_id,
            tenant_id = %handle.identity.tenant_id,
            principal = %handle.identity.principal,
            namespace = %handle.identity.namespace.path(),
            "Connection registered"
        );

        Ok(())
    }

    /// Unregister a connection. Returns the handle if it was registered.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&connection_id)?;
        self.release_slot();

        if let Some(mut tenant_conns) = self.tenant_index.get_mut(&handle.identity.tenant_id) {
            tenant_conns.remove(&connection_id);
            if tenant_conns.is_empty() {
                drop(tenant_conns);
                self.tenant_index
                    .remove_if(&handle.identity.tenant_id, |_, c| c.is_empty());
            }
        }

        if let Some(device) = handle.identity.device_key() {
            if let Some(mut device_conns) = self.device_index.get_mut(&device) {
                device_conns.remove(&connection_id);
                if device_conns.is_empty() {
                    drop(device_conns);
                    self.device_index.remove_if(&device, |_, c| c.is_empty());
                }
            }
        }

        tracing::info!(
            connection_id = %connection_id,
            tenant_id = %handle.identity.tenant_id,
            "Connection unregistered"
        );

        Some(handle)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn tenant_connections(&self, tenant_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.tenant_index
            .get(tenant_id)
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_index.contains_key(tenant_id)
    }

    pub fn device_connections(&self, device: &DeviceKey) -> Vec<Arc<ConnectionHandle>> {
        self.device_index
            .get(device)
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every local client connection with its device key (for presence refresh)
    pub fn client_connections(&self) -> Vec<(DeviceKey, ConnectionId)> {
        self.device_index
            .iter()
            .flat_map(|entry| {
                let device = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |id| (device.clone(), *id))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Connections with no inbound activity since `cutoff`
    pub fn find_stale(&self, cutoff: DateTime<Utc>) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().last_seen_at() < cutoff)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut client_connections = 0;
        let mut admin_connections = 0;
        let mut queued_bytes = 0;
        for entry in self.connections.iter() {
            match entry.value().namespace() {
                Namespace::Client => client_connections += 1,
                Namespace::Admin => admin_connections += 1,
            }
            queued_bytes += entry.value().queued_bytes();
        }

        let tenants: HashMap<String, usize> = self
            .tenant_index
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();

        ConnectionStats {
            total_connections: self.connections.len(),
            client_connections,
            admin_connections,
            unique_devices: self.device_index.len(),
            queued_bytes,
            tenants,
        }
    }

    pub fn tenant_stats(&self, tenant_id: &str) -> TenantConnectionStats {
        let connections = self.tenant_connections(tenant_id);
        let devices: HashSet<DeviceKey> = connections
            .iter()
            .filter_map(|h| h.identity.device_key())
            .collect();
        let admin_connections = connections
            .iter()
            .filter(|h| h.namespace() == Namespace::Admin)
            .count();

        TenantConnectionStats {
            tenant_id: tenant_id.to_string(),
            total_connections: connections.len(),
            unique_devices: devices.len(),
            admin_connections,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{CloseSignal, ConnectionIdentity, OutboundQueue};
    use uuid::Uuid;

    fn handle(identity: ConnectionIdentity) -> Arc<ConnectionHandle> {
        let (queue, _rx) = OutboundQueue::channel(1024);
        Arc::new(ConnectionHandle::new(
            Uuid::new_v4(),
            identity,
            queue,
            CloseSignal::new(),
        ))
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let h = handle(ConnectionIdentity::device("t1", "d1"));
        registry.register(h.clone()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tenant_connections("t1").len(), 1);
        assert_eq!(
            registry.device_connections(&DeviceKey::new("t1", "d1")).len(),
            1
        );

        assert!(registry.unregister(h.id).is_some());
        assert!(registry.unregister(h.id).is_none());
        assert!(registry.is_empty());
        assert!(!registry.has_tenant("t1"));
        assert!(registry.client_connections().is_empty());
    }

    #[test]
    fn test_multiple_connections_per_device() {
        let registry = ConnectionRegistry::new();
        registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap();
        registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap();
        registry
            .register(handle(ConnectionIdentity::admin("t1", "ops")))
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.client_connections, 2);
        assert_eq!(stats.admin_connections, 1);
        assert_eq!(stats.unique_devices, 1);
        assert_eq!(registry.client_connections().len(), 2);
    }

    #[test]
    fn test_total_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 1,
            max_connections_per_device: 8,
        });
        registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap();
        let err = registry
            .register(handle(ConnectionIdentity::device("t1", "d2")))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::TotalLimitExceeded { .. }));
    }

    #[test]
    fn test_total_limit_holds_under_concurrent_registration() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 100,
            max_connections_per_device: 8,
        });

        let accepted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|worker| {
                    let registry = &registry;
                    scope.spawn(move || {
                        (0..50)
                            .filter(|i| {
                                let device = format!("d{}-{}", worker, i);
                                registry
                                    .register(handle(ConnectionIdentity::device("t1", &device)))
                                    .is_ok()
                            })
                            .count()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(accepted, 100);
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_rejected_and_removed_connections_free_their_slot() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 2,
            max_connections_per_device: 1,
        });
        let first = handle(ConnectionIdentity::device("t1", "d1"));
        registry.register(first.clone()).unwrap();

        // Device limit refusal must not consume a node-wide slot
        let err = registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DeviceLimitExceeded { .. }));
        registry
            .register(handle(ConnectionIdentity::device("t1", "d2")))
            .unwrap();

        registry.unregister(first.id);
        registry
            .register(handle(ConnectionIdentity::device("t1", "d3")))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_device_limit() {
        let registry = ConnectionRegistry::with_limits(ConnectionLimits {
            max_connections: 10,
            max_connections_per_device: 1,
        });
        registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap();
        let err = registry
            .register(handle(ConnectionIdentity::device("t1", "d1")))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DeviceLimitExceeded { .. }));
        assert_eq!(registry.len(), 1);

        // Admins never count against device limits
        registry
            .register(handle(ConnectionIdentity::admin("t1", "d1")))
            .unwrap();
    }

    #[test]
    fn test_find_stale() {
        let registry = ConnectionRegistry::new();
        let h = handle(ConnectionIdentity::device("t1", "d1"));
        registry.register(h.clone()).unwrap();

        let future = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(registry.find_stale(future).len(), 1);
        let past = Utc::now() - chrono::Duration::seconds(10);
        assert!(registry.find_stale(past).is_empty());
    }
}
