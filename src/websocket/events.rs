//! Server-to-client event builders.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::connection_manager::{CloseReason, ConnectionHandle, ConnectionId};
use crate::protocol::EventMessage;

pub const CONNECTED: &str = "connected";
pub const CONVERSATION_JOINED: &str = "conversation.joined";
pub const CONVERSATION_LEFT: &str = "conversation.left";
pub const TYPING: &str = "typing";
pub const SERVER_SHUTDOWN: &str = "server.shutdown";
pub const ERROR: &str = "error";
pub const SESSION_CONNECT: &str = "session.connect";
pub const SESSION_DISCONNECT: &str = "session.disconnect";
pub const PRESENCE_CHANGED: &str = "presence.changed";

/// Error codes carried by `error` events and failed acks.
pub mod codes {
    pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const NOT_A_MEMBER: &str = "NOT_A_MEMBER";
}

pub struct ServerEvent;

impl ServerEvent {
    pub fn connected(connection_id: ConnectionId) -> EventMessage {
        EventMessage::with_payload(CONNECTED, json!({ "connectionId": connection_id }))
    }

    pub fn joined(room_id: &str, cursor: Option<&str>) -> EventMessage {
        EventMessage::with_payload(
            CONVERSATION_JOINED,
            json!({ "roomId": room_id, "cursor": cursor }),
        )
    }

    pub fn left(room_id: &str) -> EventMessage {
        EventMessage::with_payload(CONVERSATION_LEFT, json!({ "roomId": room_id }))
    }

    pub fn typing(room_id: &str, who: &str, is_typing: bool) -> EventMessage {
        EventMessage::with_payload(
            TYPING,
            json!({ "roomId": room_id, "who": who, "isTyping": is_typing }),
        )
    }

    pub fn server_shutdown(reconnect_delay_ms: u64) -> EventMessage {
        EventMessage::with_payload(
            SERVER_SHUTDOWN,
            json!({ "reconnectDelayMs": reconnect_delay_ms }),
        )
    }

    pub fn error(code: &str, message: impl Into<String>) -> EventMessage {
        EventMessage::with_payload(ERROR, json!({ "code": code, "message": message.into() }))
    }

    pub fn session_connect(handle: &ConnectionHandle) -> EventMessage {
        EventMessage::with_payload(
            SESSION_CONNECT,
            json!({
                "connectionId": handle.id,
                "namespace": handle.namespace().path(),
                "principal": handle.identity.principal,
                "connectedAt": handle.connected_at,
            }),
        )
    }

    pub fn session_disconnect(
        handle: &ConnectionHandle,
        reason: CloseReason,
        disconnected_at: DateTime<Utc>,
    ) -> EventMessage {
        EventMessage::with_payload(
            SESSION_DISCONNECT,
            json!({
                "connectionId": handle.id,
                "namespace": handle.namespace().path(),
                "principal": handle.identity.principal,
                "reason": reason.as_str(),
                "disconnectedAt": disconnected_at,
            }),
        )
    }

    pub fn presence_changed(device_id: &str, online: bool) -> EventMessage {
        EventMessage::with_payload(
            PRESENCE_CHANGED,
            json!({ "deviceId": device_id, "online": online }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shapes() {
        let joined = ServerEvent::joined("conv-1", Some("m-9"));
        assert_eq!(joined.name, "conversation.joined");
        assert_eq!(joined.payload().unwrap()["cursor"], "m-9");

        let joined = ServerEvent::joined("conv-1", None);
        assert!(joined.payload().unwrap()["cursor"].is_null());

        let typing = ServerEvent::typing("conv-1", "d1", true);
        assert_eq!(
            typing.payload().unwrap(),
            &json!({"roomId": "conv-1", "who": "d1", "isTyping": true})
        );

        let shutdown = ServerEvent::server_shutdown(5000);
        assert_eq!(shutdown.payload().unwrap()["reconnectDelayMs"], 5000);

        let presence = ServerEvent::presence_changed("d1", false);
        assert_eq!(presence.payload().unwrap()["online"], false);
    }
}
