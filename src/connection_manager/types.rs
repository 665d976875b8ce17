//! Connection handle and related types

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::{EventMessage, Frame, Packet};

use super::ack::{AckError, AckRegistry};
use super::outbound::{OutboundError, OutboundQueue};

pub type ConnectionId = Uuid;

/// Trust domain a connection authenticated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// End-user devices on `/`
    Client,
    /// Operator consoles on `/admin`
    Admin,
}

impl Namespace {
    pub fn path(&self) -> &'static str {
        match self {
            Namespace::Client => "/",
            Namespace::Admin => "/admin",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/" | "" => Some(Namespace::Client),
            "/admin" => Some(Namespace::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Client => "client",
            Namespace::Admin => "admin",
        }
    }
}

/// A logical device within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub tenant_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(tenant_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.device_id)
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub tenant_id: String,
    /// Device id on `/`, admin principal on `/admin`
    pub principal: String,
    pub namespace: Namespace,
}

impl ConnectionIdentity {
    pub fn device(tenant_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            principal: device_id.into(),
            namespace: Namespace::Client,
        }
    }

    pub fn admin(tenant_id: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            principal: principal.into(),
            namespace: Namespace::Admin,
        }
    }

    /// Presence key; only client connections are devices.
    pub fn device_key(&self) -> Option<DeviceKey> {
        match self.namespace {
            Namespace::Client => Some(DeviceKey::new(&self.tenant_id, &self.principal)),
            Namespace::Admin => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Handshaking = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_raw(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Open,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection ended; maps onto a websocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT/CLOSE or the socket ended
    ClientClosed,
    /// Server closed the connection after draining
    ServerShutdown,
    GoingAway,
    ProtocolViolation,
    HeartbeatTimeout,
    HandshakeTimeout,
    AuthFailed,
    Backpressure,
    TransportError,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::ServerShutdown => 1000,
            CloseReason::GoingAway | CloseReason::TransportError => 1001,
            CloseReason::ProtocolViolation => 1002,
            CloseReason::HeartbeatTimeout => 4000,
            CloseReason::HandshakeTimeout => 4001,
            CloseReason::AuthFailed => 4003,
            CloseReason::Backpressure => 4008,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::GoingAway => "going_away",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::Backpressure => "backpressure",
            CloseReason::TransportError => "transport_error",
        }
    }

    /// Whether frames still queued for the peer are dropped instead of flushed.
    pub fn discards_pending(&self) -> bool {
        matches!(
            self,
            CloseReason::ProtocolViolation
                | CloseReason::HeartbeatTimeout
                | CloseReason::Backpressure
                | CloseReason::TransportError
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot close request shared by a connection's reader, writer and handle.
///
/// The first reason wins; later requests are ignored.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request a close. Returns `true` if this call set the reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<CloseReason> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.tx.subscribe()
    }

    /// Resolve once a close has been requested.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::TransportError;
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when connection limits are exceeded
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },

    #[error("Device {device} connection limit exceeded ({current}/{max})")]
    DeviceLimitExceeded {
        device: String,
        current: usize,
        max: usize,
    },
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_device: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_device: 8,
        }
    }
}

impl From<&crate::config::TransportConfig> for ConnectionLimits {
    fn from(config: &crate::config::TransportConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_connections_per_device: config.max_connections_per_device,
        }
    }
}

/// Handle for a single authenticated realtime connection.
///
/// The session task owns the socket; everything else talks to the connection
/// through this handle. Sends are synchronous enqueues that never block the
/// caller; a connection whose queue overflows closes itself for backpressure.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: ConnectionIdentity,
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity (unix millis)
    last_seen_ms: AtomicI64,
    state: AtomicU8,
    outbound: OutboundQueue,
    acks: AckRegistry,
    close: CloseSignal,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        identity: ConnectionIdentity,
        outbound: OutboundQueue,
        close: CloseSignal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            identity,
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            state: AtomicU8::new(ConnectionState::Handshaking as u8),
            outbound,
            acks: AckRegistry::new(),
            close,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.identity.tenant_id
    }

    pub fn namespace(&self) -> Namespace {
        self.identity.namespace
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Open or draining; closed connections accept no new work.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), ConnectionState::Open | ConnectionState::Draining)
    }

    pub fn queued_bytes(&self) -> usize {
        self.outbound.queued_bytes()
    }

    pub fn acks(&self) -> &AckRegistry {
        &self.acks
    }

    pub fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// Ask the session to close this connection.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close.close(reason)
    }

    /// Enqueue pre-encoded wire text.
    pub fn send_text(&self, text: String) -> Result<(), OutboundError> {
        match self.outbound.push(text) {
            Ok(()) => Ok(()),
            Err(e @ OutboundError::Backpressure { .. }) => {
                if self.close(CloseReason::Backpressure) {
                    tracing::warn!(
                        connection_id = %self.id,
                        tenant_id = %self.identity.tenant_id,
                        queued_bytes = self.outbound.queued_bytes(),
                        "Outbound queue over limit, closing slow consumer"
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), OutboundError> {
        self.send_text(frame.encode())
    }

    pub fn send_packet(&self, packet: Packet) -> Result<(), OutboundError> {
        self.send_frame(&Frame::Message(packet))
    }

    /// Emit an event on this connection's namespace.
    pub fn emit(&self, event: EventMessage) -> Result<(), OutboundError> {
        self.send_packet(Packet::event(self.identity.namespace.path(), event))
    }

    /// Emit an event and wait for the peer's ACK.
    ///
    /// A timeout is reported to the caller; the connection stays open.
    pub async fn emit_with_ack(
        &self,
        event: EventMessage,
        timeout: Duration,
    ) -> Result<Vec<Value>, AckError> {
        let waiter = self.acks.register(timeout);
        let packet = Packet::Event {
            namespace: self.identity.namespace.path().to_string(),
            ack_id: Some(waiter.ack_id()),
            event,
        };
        if let Err(e) = self.send_packet(packet) {
            self.acks.forget(waiter.ack_id());
            return Err(AckError::Send(e.to_string()));
        }
        waiter.wait().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::outbound::OutboundFrame;
    use serde_json::json;

    fn handle_with_limit(limit: usize) -> (ConnectionHandle, crate::connection_manager::OutboundReceiver) {
        let (queue, rx) = OutboundQueue::channel(limit);
        let handle = ConnectionHandle::new(
            Uuid::new_v4(),
            ConnectionIdentity::device("t1", "d1"),
            queue,
            CloseSignal::new(),
        );
        handle.set_state(ConnectionState::Open);
        (handle, rx)
    }

    #[test]
    fn test_namespace_paths() {
        assert_eq!(Namespace::from_path("/"), Some(Namespace::Client));
        assert_eq!(Namespace::from_path("/admin"), Some(Namespace::Admin));
        assert_eq!(Namespace::from_path("/other"), None);
        assert_eq!(Namespace::Admin.path(), "/admin");
    }

    #[test]
    fn test_only_client_identities_are_devices() {
        let device = ConnectionIdentity::device("t1", "d1");
        assert_eq!(device.device_key().unwrap().to_string(), "t1:d1");
        assert!(ConnectionIdentity::admin("t1", "ops").device_key().is_none());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::ServerShutdown.code(), 1000);
        assert_eq!(CloseReason::ProtocolViolation.code(), 1002);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 4000);
        assert_eq!(CloseReason::AuthFailed.code(), 4003);
        assert_eq!(CloseReason::Backpressure.code(), 4008);
    }

    #[test]
    fn test_close_signal_first_reason_wins() {
        let signal = CloseSignal::new();
        assert!(signal.close(CloseReason::HeartbeatTimeout));
        assert!(!signal.close(CloseReason::ClientClosed));
        assert_eq!(signal.reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_emit_encodes_on_connection_namespace() {
        let (handle, mut rx) = handle_with_limit(1024);
        handle
            .emit(EventMessage::with_payload("connected", json!({"connectionId": "c"})))
            .unwrap();

        match rx.recv().await.unwrap() {
            OutboundFrame::Text(text) => assert!(text.starts_with(r#"42["connected""#)),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backpressure_closes_connection() {
        let (handle, _rx) = handle_with_limit(64);
        let big = "x".repeat(100);
        let result = handle.send_text(big);

        assert!(matches!(result, Err(OutboundError::Backpressure { .. })));
        assert_eq!(handle.close_signal().reason(), Some(CloseReason::Backpressure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_with_ack_times_out_without_closing() {
        let (handle, _rx) = handle_with_limit(1024);
        let result = handle
            .emit_with_ack(EventMessage::new("ping.me", vec![]), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(AckError::Timeout { .. })));
        assert_eq!(handle.close_signal().reason(), None);
        assert_eq!(handle.acks().pending_count(), 0);
    }
}
