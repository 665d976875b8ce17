//! Presence store trait and shared types.

use std::time::Duration;

use async_trait::async_trait;

use crate::connection_manager::{ConnectionId, DeviceKey};
use crate::redis::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Shared store error: {0}")]
    Store(#[from] PoolError),

    #[error("Presence store unavailable: {0}")]
    Unavailable(String),
}

/// Result of one atomic add or remove against a device's connection set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMutation {
    /// Whether the member was actually added or removed
    pub changed: bool,
    /// Live members after the mutation
    pub cardinality: u64,
}

/// Boundary crossing caused by a connection opening or closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    Unchanged,
}

impl PresenceTransition {
    pub fn after_add(mutation: SetMutation) -> Self {
        if mutation.changed && mutation.cardinality == 1 {
            PresenceTransition::CameOnline
        } else {
            PresenceTransition::Unchanged
        }
    }

    pub fn after_remove(mutation: SetMutation) -> Self {
        if mutation.changed && mutation.cardinality == 0 {
            PresenceTransition::WentOffline
        } else {
            PresenceTransition::Unchanged
        }
    }

    /// `Some(online)` when the device crossed the 0/1 boundary.
    pub fn online(&self) -> Option<bool> {
        match self {
            PresenceTransition::CameOnline => Some(true),
            PresenceTransition::WentOffline => Some(false),
            PresenceTransition::Unchanged => None,
        }
    }
}

/// Device -> connection-set mapping.
///
/// Every member carries an expiry; expired members do not count and are pruned
/// on the next mutation. `add_connection` and `remove_connection` must mutate
/// and read the cardinality as one atomic step.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn add_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
        ttl: Duration,
    ) -> Result<SetMutation, PresenceError>;

    async fn remove_connection(
        &self,
        device: &DeviceKey,
        connection_id: ConnectionId,
    ) -> Result<SetMutation, PresenceError>;

    async fn connection_count(&self, device: &DeviceKey) -> Result<u64, PresenceError>;

    /// Counts for many devices in one round trip, in input order.
    async fn connection_counts(&self, devices: &[DeviceKey]) -> Result<Vec<u64>, PresenceError>;

    /// Push the expiry of existing members out to `now + ttl`.
    ///
    /// Members that are no longer present are not re-added.
    async fn refresh(
        &self,
        entries: &[(DeviceKey, ConnectionId)],
        ttl: Duration,
    ) -> Result<(), PresenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_at_boundaries() {
        let first = SetMutation { changed: true, cardinality: 1 };
        let second = SetMutation { changed: true, cardinality: 2 };
        let repeat = SetMutation { changed: false, cardinality: 1 };
        assert_eq!(PresenceTransition::after_add(first), PresenceTransition::CameOnline);
        assert_eq!(PresenceTransition::after_add(second), PresenceTransition::Unchanged);
        assert_eq!(PresenceTransition::after_add(repeat), PresenceTransition::Unchanged);

        let last = SetMutation { changed: true, cardinality: 0 };
        let unknown = SetMutation { changed: false, cardinality: 0 };
        assert_eq!(PresenceTransition::after_remove(last), PresenceTransition::WentOffline);
        assert_eq!(PresenceTransition::after_remove(unknown), PresenceTransition::Unchanged);
    }
}
