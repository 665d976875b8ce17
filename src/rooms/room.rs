use crate::connection_manager::Namespace;

pub const MAX_ROOM_ID_LEN: usize = 128;

/// A room within one tenant and namespace.
///
/// The same `room_id` in `/` and `/admin`, or in two tenants, names different
/// rooms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub tenant_id: String,
    pub namespace: Namespace,
    pub room_id: String,
}

impl RoomKey {
    pub fn new(tenant_id: impl Into<String>, namespace: Namespace, room_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace,
            room_id: room_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Connection is not open")]
    ConnectionClosed,

    #[error("Not a member of room {0}")]
    NotMember(String),
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::InvalidRoomId(_) => "INVALID_ROOM",
            RoomError::ConnectionClosed => "CONNECTION_CLOSED",
            RoomError::NotMember(_) => "NOT_A_MEMBER",
        }
    }
}

/// Room ids are 1..=128 characters of `[A-Za-z0-9_.:-]`.
pub fn validate_room_id(room_id: &str) -> Result<(), RoomError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(RoomError::InvalidRoomId(room_id.chars().take(MAX_ROOM_ID_LEN).collect()))
    }
}
