//! Room membership and broadcast fan-out.

mod room;
mod router;

pub use room::{validate_room_id, RoomError, RoomKey, MAX_ROOM_ID_LEN};
pub use router::{DeliveryReport, JoinOutcome, RoomRouter, RouterStats, MESSAGE_NEW_EVENT};
