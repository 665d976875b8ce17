use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::auth::{create_credential_store, Authenticator};
use crate::backoff::RetryPolicy;
use crate::cluster::{create_bus, Bus, ClusterBus, MemoryBus, RedisBus};
use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionRegistry};
use crate::presence::{create_presence_store, MemoryPresenceStore, PresenceAggregator, PresenceStore};
use crate::redis::{CircuitBreaker, RedisHealth, RedisPool};
use crate::rooms::RoomRouter;
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Authenticator,
    pub presence: Arc<PresenceAggregator>,
    pub router: Arc<RoomRouter>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub redis_health: Arc<RedisHealth>,
    pub redis_pool: Option<Arc<RedisPool>>,
    /// Subscriber loop to spawn when the bus runs on Redis
    pub redis_bus: Option<Arc<RedisBus>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state from configuration, connecting to Redis when a
    /// backend asks for it.
    pub fn new(settings: Settings) -> Self {
        let (redis_pool, redis_health) = if settings.uses_redis() {
            let health = Arc::new(RedisHealth::new());
            let circuit_breaker = Arc::new(CircuitBreaker::with_config((&settings.redis).into()));
            match RedisPool::new(&settings.redis, circuit_breaker, health.clone()) {
                Ok(pool) => {
                    tracing::info!(url = %pool.url(), "Redis pool created");
                    (Some(Arc::new(pool)), health)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Invalid Redis configuration, running on in-memory backends");
                    (None, Arc::new(RedisHealth::disabled()))
                }
            }
        } else {
            (None, Arc::new(RedisHealth::disabled()))
        };

        let presence_store = create_presence_store(&settings.presence, redis_pool.clone());
        let cluster_bus = create_bus(&settings.cluster, &settings.redis, redis_pool.clone());
        let redis_bus = match &cluster_bus {
            ClusterBus::Redis(bus) => Some(bus.clone()),
            ClusterBus::Memory(_) => None,
        };

        Self::assemble(
            settings,
            presence_store,
            cluster_bus.as_bus(),
            redis_health,
            redis_pool,
            redis_bus,
        )
    }

    /// Single-node state on in-memory backends.
    pub fn in_memory(settings: Settings) -> Self {
        Self::in_memory_with_bus(settings, Arc::new(MemoryBus::new()))
    }

    /// In-memory state attached to a caller-provided bus, so several
    /// nodes can run in one process.
    pub fn in_memory_with_bus(settings: Settings, bus: Arc<dyn Bus>) -> Self {
        Self::assemble(
            settings,
            Arc::new(MemoryPresenceStore::new()),
            bus,
            Arc::new(RedisHealth::disabled()),
            None,
            None,
        )
    }

    fn assemble(
        settings: Settings,
        presence_store: Arc<dyn PresenceStore>,
        bus: Arc<dyn Bus>,
        redis_health: Arc<RedisHealth>,
        redis_pool: Option<Arc<RedisPool>>,
        redis_bus: Option<Arc<RedisBus>>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_limits(ConnectionLimits::from(
            &settings.transport,
        )));

        let retry = RetryPolicy {
            max_attempts: settings.redis.retry_attempts,
            ..RetryPolicy::default()
        };

        let authenticator = Authenticator::new(create_credential_store(&settings.auth));

        let presence = Arc::new(PresenceAggregator::new(
            presence_store,
            settings.presence.ttl(),
            retry.clone(),
            redis_health.clone(),
        ));

        let server_id = settings.cluster.resolve_server_id();
        let router = Arc::new(RoomRouter::new(
            server_id.clone(),
            registry.clone(),
            bus,
            settings.cluster.channel_prefix.clone(),
            settings.cluster.dedupe_capacity,
            retry,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown = Arc::new(ShutdownCoordinator::new(
            registry.clone(),
            settings.shutdown.clone(),
            shutdown_tx,
        ));

        tracing::info!(
            server_id = %server_id,
            auth_backend = authenticator.backend_name(),
            presence_backend = presence.backend_name(),
            bus_backend = router.bus_backend(),
            "Application state initialized"
        );

        Self {
            settings: Arc::new(settings),
            registry,
            authenticator,
            presence,
            router,
            shutdown,
            redis_health,
            redis_pool,
            redis_bus,
            start_time: Instant::now(),
        }
    }
}
