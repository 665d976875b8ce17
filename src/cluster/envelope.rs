use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection_manager::{ConnectionId, Namespace};
use crate::protocol::EventMessage;

use super::bus::BusError;

/// Who an envelope is addressed to within its tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// Members of a room in each listed namespace
    Room {
        namespaces: Vec<Namespace>,
        room_id: String,
    },
    /// Every client connection of one device
    Device { device_id: String },
}

impl DeliveryTarget {
    pub fn room(namespaces: &[Namespace], room_id: impl Into<String>) -> Self {
        DeliveryTarget::Room {
            namespaces: namespaces.to_vec(),
            room_id: room_id.into(),
        }
    }

    pub fn admin_room(tenant_id: &str) -> Self {
        Self::room(&[Namespace::Admin], tenant_admin_room(tenant_id))
    }
}

/// Room every admin connection of a tenant joins on connect.
pub fn tenant_admin_room(tenant_id: &str) -> String {
    format!("tenant:{}", tenant_id)
}

/// An event fanned out to other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Idempotency key; replays with a seen id are dropped
    pub id: Uuid,
    /// Server id of the publishing node
    pub origin: String,
    pub tenant_id: String,
    pub target: DeliveryTarget,
    /// Connections that must not receive this event
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<ConnectionId>,
    pub event: EventMessage,
}

impl BusEnvelope {
    pub fn new(
        origin: impl Into<String>,
        tenant_id: impl Into<String>,
        target: DeliveryTarget,
        exclude: Vec<ConnectionId>,
        event: EventMessage,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            tenant_id: tenant_id.into(),
            target,
            exclude,
            event,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, BusError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bus channel carrying every envelope for a tenant.
pub fn tenant_channel(prefix: &str, tenant_id: &str) -> String {
    format!("{}:tenant:{}", prefix, tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let envelope = BusEnvelope::new(
            "node-a",
            "t1",
            DeliveryTarget::room(&[Namespace::Client, Namespace::Admin], "conv-1"),
            vec![],
            EventMessage::with_payload("typing", json!({"roomId": "conv-1"})),
        );
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(value["target"]["kind"], "room");
        assert_eq!(value["target"]["namespaces"], json!(["client", "admin"]));
        assert!(value.get("exclude").is_none());
        assert_eq!(BusEnvelope::from_bytes(&serde_json::to_vec(&value).unwrap()).unwrap(), envelope);
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(BusEnvelope::from_bytes(b"{not json").is_err());
    }

    #[test]
    fn test_channel_and_admin_room_names() {
        assert_eq!(tenant_channel("ara:rt", "t1"), "ara:rt:tenant:t1");
        assert_eq!(
            DeliveryTarget::admin_room("t1"),
            DeliveryTarget::Room {
                namespaces: vec![Namespace::Admin],
                room_id: "tenant:t1".to_string()
            }
        );
    }
}
