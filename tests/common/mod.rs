//! Helpers shared by the integration tests.
//!
//! Sessions run through `serve_connection` over in-process channels, so the
//! tests exercise the real handshake, codec and cleanup paths without
//! binding sockets.

#![allow(dead_code)]

use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ara_realtime_gateway::config::{AuthBackend, Settings, StaticTenantConfig};
use ara_realtime_gateway::protocol::{EventMessage, Frame, Packet};
use ara_realtime_gateway::server::AppState;
use ara_realtime_gateway::websocket::{serve_connection, WireMessage};

pub const TENANT: &str = "t1";
pub const DEVICE_SECRET: &str = "device-secret";
pub const ADMIN_SECRET: &str = "admin-secret";

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.backend = AuthBackend::Static;
    settings.auth.tenants = vec![StaticTenantConfig {
        tenant_id: TENANT.into(),
        device_secret: DEVICE_SECRET.into(),
        admin_secret: ADMIN_SECRET.into(),
    }];
    settings
}

/// The remote end of one session.
pub struct Peer {
    to_server: mpsc::UnboundedSender<WireMessage>,
    from_server: mpsc::UnboundedReceiver<WireMessage>,
    pub task: JoinHandle<()>,
}

impl Peer {
    pub fn spawn(state: &AppState) -> Self {
        let (to_server, server_rx) = mpsc::unbounded();
        let (server_tx, from_server) = mpsc::unbounded();
        let task = tokio::spawn(serve_connection(state.clone(), server_rx, server_tx));
        Self {
            to_server,
            from_server,
            task,
        }
    }

    pub fn send(&self, text: &str) {
        self.to_server
            .unbounded_send(WireMessage::Text(text.to_string()))
            .expect("session gone");
    }

    pub async fn recv(&mut self) -> WireMessage {
        timeout(Duration::from_secs(30), self.from_server.next())
            .await
            .expect("timed out waiting for server")
            .expect("server stream ended")
    }

    /// Next decoded frame, answering server pings on the way.
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            match self.recv().await {
                WireMessage::Text(text) => {
                    let frame = Frame::decode(&text).expect("server sent malformed frame");
                    if frame == Frame::Ping {
                        self.send("3");
                        continue;
                    }
                    return frame;
                }
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    pub async fn recv_packet(&mut self) -> Packet {
        match self.recv_frame().await {
            Frame::Message(packet) => packet,
            other => panic!("expected message frame, got {:?}", other),
        }
    }

    pub async fn recv_event(&mut self) -> EventMessage {
        match self.recv_packet().await {
            Packet::Event { event, .. } => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    /// Read events until one named `name` arrives; returns it with the
    /// names of everything skipped before it.
    pub async fn recv_event_named(&mut self, name: &str) -> (EventMessage, Vec<String>) {
        let mut skipped = Vec::new();
        loop {
            let event = self.recv_event().await;
            if event.name == name {
                return (event, skipped);
            }
            skipped.push(event.name);
        }
    }

    pub async fn recv_close_code(&mut self) -> Option<u16> {
        loop {
            if let WireMessage::Close { code, .. } = self.recv().await {
                return code;
            }
        }
    }

    /// Send `41` and wait for the session to finish cleanup.
    pub async fn disconnect(mut self) {
        self.send("41");
        let _ = self.recv_close_code().await;
        self.task.await.expect("session panicked");
    }
}

async fn expect_open(peer: &mut Peer) {
    assert!(matches!(peer.recv_frame().await, Frame::Open(_)));
}

pub async fn connect_device(state: &AppState, device_id: &str) -> Peer {
    let mut peer = Peer::spawn(state);
    expect_open(&mut peer).await;
    peer.send(&format!(
        r#"40{{"tenantId":"{}","deviceId":"{}","credential":"{}"}}"#,
        TENANT, device_id, DEVICE_SECRET
    ));
    assert!(matches!(peer.recv_packet().await, Packet::Connect { .. }));
    assert_eq!(peer.recv_event().await.name, "connected");
    peer
}

pub async fn connect_admin(state: &AppState) -> Peer {
    let mut peer = Peer::spawn(state);
    expect_open(&mut peer).await;
    peer.send(&format!(
        r#"40/admin,{{"tenantId":"{}","adminCredential":"{}"}}"#,
        TENANT, ADMIN_SECRET
    ));
    assert!(matches!(peer.recv_packet().await, Packet::Connect { .. }));
    assert_eq!(peer.recv_event().await.name, "connected");
    peer
}

/// Join a room with an ack and return the ack payload.
pub async fn join(peer: &mut Peer, namespace_prefix: &str, ack_id: u64, room_id: &str) -> serde_json::Value {
    peer.send(&format!(
        r#"42{}{}["join",{{"roomId":"{}"}}]"#,
        namespace_prefix, ack_id, room_id
    ));
    loop {
        match peer.recv_packet().await {
            Packet::Ack { ack_id: id, mut args, .. } if id == ack_id => return args.remove(0),
            _ => continue,
        }
    }
}
