//! Handlers for events sent by connected clients.
//!
//! Both namespaces accept `join`, `leave` and `typing`. Handlers run in the
//! connection's read loop, so one connection's events are handled in order.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cluster::DeliveryTarget;
use crate::connection_manager::{ConnectionHandle, Namespace};
use crate::metrics::TransportMetrics;
use crate::protocol::{EventMessage, Packet};
use crate::rooms::RoomKey;
use crate::server::AppState;

use super::events::{codes, ServerEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    room_id: String,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRequest {
    room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingRequest {
    room_id: String,
    is_typing: bool,
}

/// Handler failure reported back as `error{code, message}` or in the ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    pub code: &'static str,
    pub message: String,
}

impl EventFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_value(&self) -> Value {
        json!({ "error": { "code": self.code, "message": self.message } })
    }
}

fn parse<T: for<'de> Deserialize<'de>>(event: &EventMessage) -> Result<T, EventFailure> {
    let payload = event.payload().cloned().unwrap_or(Value::Null);
    serde_json::from_value(payload).map_err(|e| {
        EventFailure::new(
            codes::INVALID_PAYLOAD,
            format!("Invalid {} payload: {}", event.name, e),
        )
    })
}

/// Handle one inbound EVENT and answer its ack, if requested.
#[tracing::instrument(
    name = "ws.event",
    skip(state, handle, event),
    fields(connection_id = %handle.id, event = %event.name)
)]
pub async fn handle_event(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    ack_id: Option<u64>,
    event: EventMessage,
) {
    TransportMetrics::record_event(&event.name);

    let result = match event.name.as_str() {
        "join" => join(state, handle, &event),
        "leave" => leave(state, handle, &event),
        "typing" => typing(state, handle, &event).await,
        other => Err(EventFailure::new(
            codes::UNKNOWN_EVENT,
            format!("Unknown event: {}", other),
        )),
    };

    if let Err(ref failure) = result {
        tracing::debug!(code = failure.code, message = %failure.message, "Event rejected");
    }

    match (ack_id, result) {
        (Some(ack_id), result) => {
            let args = match result {
                Ok(value) => vec![value],
                Err(failure) => vec![failure.to_value()],
            };
            let _ = handle.send_packet(Packet::Ack {
                namespace: handle.namespace().path().to_string(),
                ack_id,
                args,
            });
        }
        (None, Err(failure)) => {
            let _ = handle.emit(ServerEvent::error(failure.code, failure.message));
        }
        (None, Ok(_)) => {}
    }
}

fn join(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    event: &EventMessage,
) -> Result<Value, EventFailure> {
    let request: JoinRequest = parse(event)?;
    let outcome = state
        .router
        .join(handle, &request.room_id, request.cursor)
        .map_err(|e| EventFailure::new(e.code(), e.to_string()))?;

    for room_id in &outcome.left {
        let _ = handle.emit(ServerEvent::left(room_id));
    }
    let _ = handle.emit(ServerEvent::joined(
        &request.room_id,
        outcome.cursor.as_deref(),
    ));

    Ok(json!({ "roomId": request.room_id, "cursor": outcome.cursor }))
}

fn leave(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    event: &EventMessage,
) -> Result<Value, EventFailure> {
    let request: LeaveRequest = parse(event)?;
    let left = state.router.leave(handle, &request.room_id);
    if left {
        let _ = handle.emit(ServerEvent::left(&request.room_id));
    }
    Ok(json!({ "roomId": request.room_id, "left": left }))
}

async fn typing(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    event: &EventMessage,
) -> Result<Value, EventFailure> {
    let request: TypingRequest = parse(event)?;
    let key = RoomKey::new(handle.tenant_id(), handle.namespace(), request.room_id.as_str());
    if !state.router.is_member(handle.id, &key) {
        return Err(EventFailure::new(
            codes::NOT_A_MEMBER,
            format!("Not a member of room {}", request.room_id),
        ));
    }

    // Typing is visible to both sides of a conversation
    let report = state
        .router
        .deliver(
            handle.tenant_id(),
            DeliveryTarget::room(&[Namespace::Client, Namespace::Admin], request.room_id.as_str()),
            ServerEvent::typing(&request.room_id, &handle.identity.principal, request.is_typing),
            vec![handle.id],
        )
        .await;

    Ok(json!({ "delivered": report.local_delivered }))
}
