use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::middleware::api_key_auth;
use crate::server::AppState;

use super::deliver::{deliver_to_device, deliver_to_room};
use super::health::{health, stats, tenant_stats};
use super::metrics::prometheus_metrics;
use super::presence::presence_query;

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Collaborator endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/deliver/room", post(deliver_to_room))
                .route("/deliver/device", post(deliver_to_device))
                .route("/presence/query", post(presence_query))
                .route("/tenants/{tenant_id}/stats", get(tenant_stats))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
