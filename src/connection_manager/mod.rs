//! Connection bookkeeping: handles, outbound queues, ack correlation and the
//! node-local registry.

mod ack;
mod outbound;
mod registry;
mod stats;
mod types;

pub use ack::{AckError, AckRegistry, AckWaiter};
pub use outbound::{OutboundError, OutboundFrame, OutboundQueue, OutboundReceiver};
pub use registry::ConnectionRegistry;
pub use stats::{ConnectionStats, TenantConnectionStats};
pub use types::{
    CloseReason, CloseSignal, ConnectionError, ConnectionHandle, ConnectionId,
    ConnectionIdentity, ConnectionLimits, ConnectionState, DeviceKey, Namespace,
};
