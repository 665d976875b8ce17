use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::metrics::{self, RedisMetrics};
use crate::redis::RedisHealthStatus;
use crate::server::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    sample_gauges(&state);

    match metrics::encode_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Gauges that are cheaper to read at scrape time than to keep current.
fn sample_gauges(state: &AppState) {
    RedisMetrics::set_connected(state.redis_health.status() == RedisHealthStatus::Healthy);
    if let Some(pool) = &state.redis_pool {
        RedisMetrics::set_circuit_state(pool.circuit_state());
    }
    metrics::ROOMS_ACTIVE.set(state.router.stats().rooms as i64);
}
