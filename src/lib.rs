// Shared building blocks
pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;

// Wire protocol and realtime core
pub mod auth;
pub mod cluster;
pub mod connection_manager;
pub mod presence;
pub mod protocol;
pub mod rooms;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Client side of the protocol
pub mod client;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
