//! In-memory presence store using DashMap.
//!
//! Used for single-node deployments, for tests, and as the node-local mirror
//! the aggregator falls back to when the shared store is unreachable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::connection_manager::{ConnectionId, DeviceKey};

use super::store::{PresenceError, PresenceStore, SetMutation};

pub struct MemoryPresenceStore {
    /// device -> (connection_id -> expiry)
    devices: DashMap<DeviceKey, HashMap<ConnectionId, Instant>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn prune(members: &mut HashMap<ConnectionId, Instant>, now: Instant) {
        members.retain(|_, expiry| *expiry > now);
    }

    fn live_count(&self, device: &DeviceKey, now: Instant) -> u64 {
        self.devices
            .get(device)
            .map(|members| members.values().filter(|expiry| **expiry > now).count() as u64)
            .unwrap_or(0)
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn add_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<SetMutation, PresenceError> {
        let now = Instant::now();
        // Entry guard makes prune + insert + count atomic per device
        let mut members = self.devices.entry(device.clone()).or_default();
        Self::prune(&mut members, now);
        let changed = members.insert(connection_id, now + ttl).is_none();

        Ok(SetMutation {
            changed,
            cardinality: members.len() as u64,
        })
    }

    async fn remove_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
    ) -> Result<SetMutation, PresenceError> {
        let now = Instant::now();
        let mutation = match self.devices.get_mut(device) {
            Some(mut members) => {
                let changed = members.remove(&connection_id).is_some();
                Self::prune(&mut members, now);
                SetMutation {
                    changed,
                    cardinality: members.len() as u64,
                }
            }
            None => SetMutation {
                changed: false,
                cardinality: 0,
            },
        };

        if mutation.cardinality == 0 {
            self.devices.remove_if(device, |_, members| members.is_empty());
        }

        Ok(mutation)
    }

    async fn connection_count(&self, device: &DeviceKey) -> Result<u64, PresenceError> {
        Ok(self.live_count(device, Instant::now()))
    }

    async fn connection_counts(&self, devices: &[DeviceKey]) -> Result<Vec<u64>, PresenceError> {
        let now = Instant::now();
        Ok(devices.iter().map(|d| self.live_count(d, now)).collect())
    }

    async fn refresh(
        &self,
        entries: &[(DeviceKey, ConnectionId)],
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        let expiry = Instant::now() + ttl;
        for (device, connection_id) in entries {
            if let Some(mut members) = self.devices.get_mut(device) {
                if let Some(existing) = members.get_mut(connection_id) {
                    *existing = expiry;
                }
            }
        }
        Ok(())
    }
}
