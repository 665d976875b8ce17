use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::websocket::ws_handler;

use super::AppState;

/// Path the realtime websocket is served on.
pub const REALTIME_PATH: &str = "/realtime";

/// Largest accepted HTTP request body (delivery payloads).
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Websocket endpoint plus the HTTP surface, sharing one [`AppState`].
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route(REALTIME_PATH, get(ws_handler))
        .merge(api_routes(state.clone()))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
