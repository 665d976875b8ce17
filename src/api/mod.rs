//! API layer - HTTP endpoint handlers organized by concern.

mod deliver;
mod health;
mod metrics;
mod presence;
mod routes;

pub use deliver::{deliver_to_device, deliver_to_room, DeliverResponse, DeviceDeliveryRequest, RoomDeliveryRequest};
pub use health::{health, stats, tenant_stats};
pub use metrics::prometheus_metrics;
pub use presence::{presence_query, PresenceQueryRequest, PresenceQueryResponse};
pub use routes::api_routes;
