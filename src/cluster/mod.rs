//! Cross-node fan-out.
//!
//! Nodes share a publish/subscribe [`Bus`]. Every event delivered to a room or
//! device is also published as a [`BusEnvelope`] on the tenant's channel, and
//! every other node with local connections for that tenant replays it.

mod bus;
mod envelope;
mod memory_bus;
mod redis_bus;

use std::sync::Arc;

pub use bus::{Bus, BusError, BusHandler, HandlerTable, SubscriptionId};
pub use envelope::{tenant_admin_room, tenant_channel, BusEnvelope, DeliveryTarget};
pub use memory_bus::MemoryBus;
pub use redis_bus::RedisBus;

use crate::backoff::BackoffConfig;
use crate::config::{BackendKind, ClusterConfig, RedisConfig};
use crate::redis::RedisPool;

/// Bus selected from configuration.
///
/// The Redis variant is returned separately so `main` can spawn its
/// subscriber loop.
pub enum ClusterBus {
    Memory(Arc<MemoryBus>),
    Redis(Arc<RedisBus>),
}

impl ClusterBus {
    pub fn as_bus(&self) -> Arc<dyn Bus> {
        match self {
            ClusterBus::Memory(bus) => bus.clone(),
            ClusterBus::Redis(bus) => bus.clone(),
        }
    }
}

pub fn create_bus(
    cluster: &ClusterConfig,
    redis: &RedisConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> ClusterBus {
    match (cluster.bus_backend, redis_pool) {
        (BackendKind::Redis, Some(pool)) => {
            tracing::info!(
                backend = "redis",
                prefix = %cluster.channel_prefix,
                "Creating Redis bus"
            );
            let backoff = BackoffConfig {
                initial_delay_ms: redis.backoff_initial_delay_ms,
                max_delay_ms: redis.backoff_max_delay_ms,
                ..BackoffConfig::default()
            };
            ClusterBus::Redis(Arc::new(RedisBus::new(
                pool,
                cluster.channel_prefix.clone(),
                backoff,
            )))
        }
        (BackendKind::Redis, None) => {
            tracing::warn!("Redis bus requested but no pool provided, running single-node");
            ClusterBus::Memory(Arc::new(MemoryBus::new()))
        }
        (BackendKind::Memory, _) => {
            tracing::info!(backend = "memory", "Creating in-process bus");
            ClusterBus::Memory(Arc::new(MemoryBus::new()))
        }
    }
}
