//! Realtime socket: upgrade, session lifecycle and inbound event handling.

pub mod events;
mod handler;
mod inbound;
mod session;

pub use events::ServerEvent;
pub use handler::{origin_allowed, ws_handler};
pub use inbound::{handle_event, EventFailure};
pub use session::{serve_connection, WireMessage};
