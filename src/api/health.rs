//! Health check and statistics endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::connection_manager::{ConnectionStats, TenantConnectionStats};
use crate::redis::{CircuitState, RedisHealthStatus};
use crate::rooms::RouterStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub draining: bool,
    pub redis: RedisHealthResponse,
    pub connections: ConnectionHealthResponse,
    pub cluster: ClusterHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub status: String,
    pub connected: bool,
    /// Times presence or fan-out fell back to node-local operation
    pub degradations: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_devices: usize,
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct ClusterHealthResponse {
    pub server_id: String,
    pub bus_backend: String,
    pub presence_backend: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStats,
    pub rooms: RouterStats,
    pub redis: RedisStats,
}

#[derive(Debug, Serialize)]
pub struct RedisStats {
    pub status: String,
    pub connected: bool,
    pub circuit_breaker_state: String,
    pub circuit_breaker_failures: u32,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
    pub degradations: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_health = state.redis_health.stats();
    let conn_stats = state.registry.stats();
    let router_stats = state.router.stats();
    let draining = state.shutdown.is_draining();

    let status = if draining {
        "draining"
    } else if !state.redis_health.is_healthy() || redis_health.degradations > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        draining,
        redis: RedisHealthResponse {
            status: redis_health.status.as_str().to_string(),
            connected: redis_health.status == RedisHealthStatus::Healthy,
            degradations: redis_health.degradations,
        },
        connections: ConnectionHealthResponse {
            total: conn_stats.total_connections,
            unique_devices: conn_stats.unique_devices,
            rooms: router_stats.rooms,
        },
        cluster: ClusterHealthResponse {
            server_id: state.router.server_id().to_string(),
            bus_backend: state.router.bus_backend().to_string(),
            presence_backend: state.presence.backend_name().to_string(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let redis_health = state.redis_health.stats();
    let (circuit_state, circuit_failures) = match &state.redis_pool {
        Some(pool) => {
            let stats = pool.circuit_stats();
            (stats.state, stats.failure_count)
        }
        None => (CircuitState::Closed, 0),
    };

    Json(StatsResponse {
        connections: state.registry.stats(),
        rooms: state.router.stats(),
        redis: RedisStats {
            status: redis_health.status.as_str().to_string(),
            connected: redis_health.status == RedisHealthStatus::Healthy,
            circuit_breaker_state: circuit_state.as_str().to_string(),
            circuit_breaker_failures: circuit_failures,
            reconnection_attempts: redis_health.reconnection_attempts,
            total_reconnections: redis_health.total_reconnections,
            degradations: redis_health.degradations,
        },
    })
}

/// GET /api/v1/tenants/{tenant_id}/stats
pub async fn tenant_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Json<TenantConnectionStats> {
    Json(state.registry.tenant_stats(&tenant_id))
}
