//! Batched presence lookup.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::connection_manager::DeviceKey;
use crate::error::{AppError, Result};
use crate::server::AppState;

/// Upper bound on devices per lookup
const MAX_DEVICES_PER_QUERY: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceQueryRequest {
    pub tenant_id: String,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PresenceQueryResponse {
    /// deviceId -> online
    pub devices: HashMap<String, bool>,
}

/// POST /api/v1/presence/query
pub async fn presence_query(
    State(state): State<AppState>,
    Json(request): Json<PresenceQueryRequest>,
) -> Result<Json<PresenceQueryResponse>> {
    if request.device_ids.len() > MAX_DEVICES_PER_QUERY {
        return Err(AppError::Validation(format!(
            "At most {} devices per query",
            MAX_DEVICES_PER_QUERY
        )));
    }

    let keys: Vec<DeviceKey> = request
        .device_ids
        .iter()
        .map(|d| DeviceKey::new(request.tenant_id.as_str(), d.as_str()))
        .collect();
    let online = state.presence.online_devices(&keys).await;

    Ok(Json(PresenceQueryResponse {
        devices: request.device_ids.into_iter().zip(online).collect(),
    }))
}
