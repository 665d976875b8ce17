use thiserror::Error;

use crate::connection_manager::AckError;
use crate::protocol::{ConnectErrorCode, ConnectErrorPayload};

/// Errors surfaced to code using [`super::RealtimeClient`].
///
/// [`ClientError::will_retry`] tells callers whether the controller keeps
/// reconnecting on its own or needs them to act (new credentials, `start`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake not completed in time")]
    HandshakeTimeout,

    #[error("No ping from server within the heartbeat window")]
    HeartbeatTimeout,

    #[error("Socket closed by server with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("Connection rejected: {} ({})", .0.message, .0.code)]
    Rejected(ConnectErrorPayload),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Client disconnected")]
    Disconnected,

    #[error(transparent)]
    Ack(#[from] AckError),

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },
}

impl ClientError {
    pub fn code(&self) -> &str {
        match self {
            ClientError::Transport(_) => "TRANSPORT_ERROR",
            ClientError::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            ClientError::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            ClientError::Closed { .. } => "CLOSED",
            ClientError::Rejected(payload) => payload.code.as_str(),
            ClientError::Protocol(_) => "PROTOCOL_ERROR",
            ClientError::NotConnected => "NOT_CONNECTED",
            ClientError::Disconnected => "DISCONNECTED",
            ClientError::Ack(AckError::Timeout { .. }) => "ACK_TIMEOUT",
            ClientError::Ack(AckError::Cancelled) => "CANCELLED",
            ClientError::Ack(_) => "ACK_FAILED",
            ClientError::Server { code, .. } => code,
        }
    }

    /// `true` when the controller recovers by itself; `false` when the
    /// caller has to change something first.
    pub fn will_retry(&self) -> bool {
        match self {
            ClientError::Rejected(payload) => payload.code == ConnectErrorCode::AuthError,
            ClientError::Disconnected
            | ClientError::Server { .. }
            | ClientError::Ack(AckError::Cancelled) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_errors_require_action() {
        let invalid = ClientError::Rejected(ConnectErrorPayload::new(
            ConnectErrorCode::InvalidCredentials,
            "bad secret",
        ));
        assert!(!invalid.will_retry());
        assert_eq!(invalid.code(), "INVALID_CREDENTIALS");

        let missing = ClientError::Rejected(ConnectErrorPayload::new(
            ConnectErrorCode::MissingParams,
            "missing deviceId",
        ));
        assert!(!missing.will_retry());

        let busy = ClientError::Rejected(ConnectErrorPayload::new(
            ConnectErrorCode::AuthError,
            "connection limit",
        ));
        assert!(busy.will_retry());
    }

    #[test]
    fn test_transport_errors_retry() {
        assert!(ClientError::Transport("refused".into()).will_retry());
        assert!(ClientError::HeartbeatTimeout.will_retry());
        assert!(ClientError::Closed { code: 1000, reason: String::new() }.will_retry());
        assert!(!ClientError::Disconnected.will_retry());
        assert_eq!(ClientError::Ack(AckError::Cancelled).code(), "CANCELLED");
    }
}
