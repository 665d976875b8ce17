use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::connection_manager::{CloseReason, OutboundError};
use crate::protocol::{ConnectErrorPayload, ProtocolError};
use crate::redis::PoolError;

/// Why a realtime connection could not continue.
///
/// Every variant except `SharedStoreUnavailable` ends the connection with the
/// close code of [`TransportError::close_reason`]. Shared-store failures
/// degrade to local-only operation instead.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication failed: {} ({})", .0.message, .0.code)]
    Auth(ConnectErrorPayload),

    #[error("Handshake not completed in time")]
    HandshakeTimeout,

    #[error("No pong within the heartbeat timeout")]
    HeartbeatTimeout,

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error("Shared store unavailable: {0}")]
    SharedStoreUnavailable(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Server is draining")]
    Draining,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            TransportError::Protocol(_) => Some(CloseReason::ProtocolViolation),
            TransportError::Auth(_) => Some(CloseReason::AuthFailed),
            TransportError::HandshakeTimeout => Some(CloseReason::HandshakeTimeout),
            TransportError::HeartbeatTimeout => Some(CloseReason::HeartbeatTimeout),
            TransportError::Outbound(OutboundError::Backpressure { .. }) => {
                Some(CloseReason::Backpressure)
            }
            TransportError::Outbound(OutboundError::Closed) | TransportError::Io(_) => {
                Some(CloseReason::TransportError)
            }
            TransportError::PeerClosed => Some(CloseReason::ClientClosed),
            TransportError::Draining => Some(CloseReason::GoingAway),
            TransportError::SharedStoreUnavailable(_) => None,
        }
    }
}

/// Errors surfaced over the HTTP API.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shared store error: {0}")]
    Store(#[from] PoolError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn masked(detail: String, public: &str) -> String {
    if is_production() {
        public.to_string()
    } else {
        detail
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                masked(e.to_string(), "Configuration error"),
            ),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                masked(msg.clone(), "Internal server error"),
            ),
            AppError::Store(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                masked(e.to_string(), "Service temporarily unavailable"),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message) = self.parts();

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %self,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
