//! Wire codec for the realtime socket.
//!
//! Two framing layers travel over one text websocket:
//!
//! - an outer transport [`Frame`] (`0` OPEN, `1` CLOSE, `2` PING, `3` PONG, `4` MESSAGE)
//! - a MESSAGE body carrying a [`Packet`]:
//!   `<kind><"/namespace,"?><ackId?><jsonPayload?>`
//!
//! Both sides of the connection (the gateway and [`crate::client`]) share this module.

mod error;
mod frame;
mod handshake;
mod packet;
mod violation;

pub use error::ProtocolError;
pub use frame::{Frame, OpenPayload};
pub use handshake::{ConnectErrorCode, ConnectErrorPayload, HandshakeAuth};
pub use packet::{EventMessage, Packet, PacketKind, ROOT_NAMESPACE};
pub use violation::ViolationBudget;

/// Default maximum size of a single inbound text frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default number of malformed frames tolerated per connection.
pub const DEFAULT_VIOLATION_BUDGET: u32 = 10;
