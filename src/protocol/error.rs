use thiserror::Error;

/// Errors produced while decoding frames and packets.
///
/// A decode error never aborts a connection on its own; the session counts it
/// against the connection's [`super::ViolationBudget`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unknown frame type: {0:?}")]
    UnknownFrameType(char),

    #[error("Unknown packet kind: {0:?}")]
    UnknownPacketKind(char),

    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    #[error("Ack id not allowed on {0} packet")]
    UnexpectedAckId(&'static str),

    #[error("Missing ack id on ACK packet")]
    MissingAckId,

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Invalid payload for {kind} packet: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Unexpected {0} in the current connection state")]
    Unexpected(&'static str),

    #[error("Packet for namespace {got} on a {expected} connection")]
    NamespaceMismatch { expected: &'static str, got: String },

    #[error("Binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolError::EmptyFrame => "empty_frame",
            ProtocolError::UnknownFrameType(_) => "unknown_frame_type",
            ProtocolError::UnknownPacketKind(_) => "unknown_packet_kind",
            ProtocolError::InvalidAckId(_) => "invalid_ack_id",
            ProtocolError::UnexpectedAckId(_) => "unexpected_ack_id",
            ProtocolError::MissingAckId => "missing_ack_id",
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
            ProtocolError::Unexpected(_) => "unexpected",
            ProtocolError::NamespaceMismatch { .. } => "namespace_mismatch",
            ProtocolError::BinaryFrame => "binary_frame",
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(e.to_string())
    }
}
