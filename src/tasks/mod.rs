mod heartbeat;

pub use heartbeat::PresenceHeartbeatTask;
