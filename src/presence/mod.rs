//! Device presence.
//!
//! A device is online while at least one of its connections, on any node, is
//! live. `PresenceAggregator` turns per-connection churn into the 0→1 and 1→0
//! transitions that become `presence.changed` events.

mod aggregator;
mod memory_store;
mod redis_store;
mod store;

use std::sync::Arc;

pub use aggregator::PresenceAggregator;
pub use memory_store::MemoryPresenceStore;
pub use redis_store::RedisPresenceStore;
pub use store::{PresenceError, PresenceStore, PresenceTransition, SetMutation};

use crate::config::{BackendKind, PresenceConfig};
use crate::redis::RedisPool;

/// Create a presence store based on configuration.
///
/// Falls back to the in-memory store when Redis is requested but no pool is
/// available.
pub fn create_presence_store(
    config: &PresenceConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn PresenceStore> {
    match (config.backend, redis_pool) {
        (BackendKind::Redis, Some(pool)) => {
            tracing::info!(
                backend = "redis",
                prefix = %config.key_prefix,
                "Creating Redis presence store"
            );
            Arc::new(RedisPresenceStore::new(pool, config.key_prefix.clone()))
        }
        (BackendKind::Redis, None) => {
            tracing::warn!("Redis presence requested but no pool provided, falling back to memory");
            Arc::new(MemoryPresenceStore::new())
        }
        (BackendKind::Memory, _) => {
            tracing::info!(backend = "memory", "Creating in-memory presence store");
            Arc::new(MemoryPresenceStore::new())
        }
    }
}
