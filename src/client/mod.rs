//! Reconnecting client for the realtime gateway.
//!
//! [`RealtimeClient`] keeps one session alive across drops: exponential
//! backoff between attempts, `server.shutdown` delays, pause/resume and
//! re-joining rooms from the last seen cursor. Transports plug in through
//! [`Connector`]; [`WsConnector`] speaks the gateway's websocket protocol.

mod controller;
mod error;
mod link;
mod state;
mod ws;

pub use controller::{ClientConfig, ClientEvent, RealtimeClient};
pub use error::ClientError;
pub use link::{Connector, Link, LinkPeer};
pub use state::{transition, ClientInput, ClientState, ClientStatus};
pub use ws::WsConnector;
