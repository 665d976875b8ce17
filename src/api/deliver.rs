//! Delivery endpoints used by the message and conversation services.

use axum::{extract::State, Json};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection_manager::{ConnectionId, DeviceKey, Namespace};
use crate::error::{AppError, Result};
use crate::protocol::EventMessage;
use crate::rooms::DeliveryReport;
use crate::server::AppState;

fn default_namespaces() -> Vec<Namespace> {
    vec![Namespace::Client]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDeliveryRequest {
    pub tenant_id: String,
    pub room_id: String,
    /// Namespaces whose copy of the room receives the event
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<Namespace>,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDeliveryRequest {
    pub tenant_id: String,
    pub device_id: String,
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Wait for each connection's ACK (this node's connections only)
    #[serde(default)]
    pub ack: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverResponse {
    pub local_delivered: usize,
    pub published: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acks: Option<Vec<ConnectionAck>>,
}

/// One connection's answer to an acknowledged delivery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub connection_id: ConnectionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<DeliveryReport> for DeliverResponse {
    fn from(report: DeliveryReport) -> Self {
        Self {
            local_delivered: report.local_delivered,
            published: report.published,
            acks: None,
        }
    }
}

fn validate_event(tenant_id: &str, event: &str) -> Result<()> {
    if tenant_id.is_empty() {
        return Err(AppError::Validation("tenantId is required".to_string()));
    }
    if event.is_empty() {
        return Err(AppError::Validation("event is required".to_string()));
    }
    Ok(())
}

/// POST /api/v1/deliver/room
#[tracing::instrument(
    name = "api.deliver_room",
    skip(state, request),
    fields(tenant_id = %request.tenant_id, room_id = %request.room_id, event = %request.event)
)]
pub async fn deliver_to_room(
    State(state): State<AppState>,
    Json(request): Json<RoomDeliveryRequest>,
) -> Result<Json<DeliverResponse>> {
    validate_event(&request.tenant_id, &request.event)?;
    if request.namespaces.is_empty() {
        return Err(AppError::Validation("namespaces must not be empty".to_string()));
    }

    let report = state
        .router
        .deliver_to_room(
            &request.tenant_id,
            &request.namespaces,
            &request.room_id,
            EventMessage::new(request.event, request.args),
        )
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;

    Ok(Json(report.into()))
}

/// POST /api/v1/deliver/device
#[tracing::instrument(
    name = "api.deliver_device",
    skip(state, request),
    fields(tenant_id = %request.tenant_id, device_id = %request.device_id, event = %request.event)
)]
pub async fn deliver_to_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceDeliveryRequest>,
) -> Result<Json<DeliverResponse>> {
    validate_event(&request.tenant_id, &request.event)?;
    if request.device_id.is_empty() {
        return Err(AppError::Validation("deviceId is required".to_string()));
    }

    if request.ack {
        return Ok(Json(deliver_with_ack(&state, request).await));
    }

    let report = state
        .router
        .deliver_to_device(
            &request.tenant_id,
            &request.device_id,
            EventMessage::new(request.event, request.args),
        )
        .await;

    Ok(Json(report.into()))
}

/// Emit to every local connection of the device and collect their ACKs,
/// each bounded by `transport.ack_timeout_ms`. Nothing is published to
/// other nodes.
async fn deliver_with_ack(state: &AppState, request: DeviceDeliveryRequest) -> DeliverResponse {
    let device = DeviceKey::new(request.tenant_id.as_str(), request.device_id.as_str());
    let timeout = state.settings.transport.ack_timeout();
    let event = EventMessage::new(request.event, request.args);
    let handles = state.registry.device_connections(&device);
    let device = &device;

    let acks = join_all(handles.iter().map(|handle| {
        let event = event.clone();
        async move {
            match handle.emit_with_ack(event, timeout).await {
                Ok(args) => ConnectionAck {
                    connection_id: handle.id,
                    args: Some(args),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(
                        connection_id = %handle.id,
                        device = %device,
                        error = %e,
                        "Acknowledged delivery failed"
                    );
                    ConnectionAck {
                        connection_id: handle.id,
                        args: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        }
    }))
    .await;

    DeliverResponse {
        local_delivered: acks.iter().filter(|a| a.error.is_none()).count(),
        published: false,
        acks: Some(acks),
    }
}
