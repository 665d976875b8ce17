//! The reconnecting client against a real gateway listening on a local port.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use ara_realtime_gateway::client::{
    ClientConfig, ClientEvent, ClientState, RealtimeClient, WsConnector,
};
use ara_realtime_gateway::connection_manager::{CloseReason, Namespace};
use ara_realtime_gateway::protocol::{EventMessage, HandshakeAuth};
use ara_realtime_gateway::server::{create_app, AppState};

use common::{settings, DEVICE_SECRET, TENANT};

async fn start_gateway(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr, credential: &str) -> RealtimeClient {
    let connector = Arc::new(WsConnector::new(format!("ws://{}/realtime", addr)));
    let auth = HandshakeAuth::Device {
        tenant_id: TENANT.to_string(),
        device_id: "d1".to_string(),
        credential: credential.to_string(),
    };
    RealtimeClient::new(connector, ClientConfig::new(auth))
}

async fn wait_for_state(client: &RealtimeClient, state: ClientState) {
    timeout(
        Duration::from_secs(10),
        client.watch_status().wait_for(|s| s.state == state),
    )
    .await
    .expect("timed out waiting for client state")
    .unwrap();
}

async fn next_matching<F>(events: &mut broadcast::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

#[tokio::test]
async fn test_client_joins_receives_and_rejoins_after_drop() {
    let state = AppState::in_memory(settings());
    let addr = start_gateway(state.clone()).await;

    let client = client(addr, DEVICE_SECRET);
    let mut events = client.subscribe_events();
    client.start();
    wait_for_state(&client, ClientState::Connected).await;

    assert_eq!(client.join_room("conv-1", None).await.unwrap(), None);

    state
        .router
        .deliver_to_room(
            TENANT,
            &[Namespace::Client],
            "conv-1",
            EventMessage::with_payload("message.new", json!({ "roomId": "conv-1", "id": "m-1" })),
        )
        .await
        .unwrap();
    next_matching(&mut events, |e| {
        matches!(e, ClientEvent::Event(event) if event.name == "message.new")
    })
    .await;

    // Drop the connection from the server side
    for handle in state.registry.all() {
        handle.close(CloseReason::GoingAway);
    }

    let rejoined = next_matching(&mut events, |e| matches!(e, ClientEvent::Rejoined { .. })).await;
    match rejoined {
        ClientEvent::Rejoined { room_id, cursor } => {
            assert_eq!(room_id, "conv-1");
            assert_eq!(cursor.as_deref(), Some("m-1"));
        }
        _ => unreachable!(),
    }
    assert_eq!(client.status().state, ClientState::Connected);
    assert_eq!(state.registry.len(), 1);

    client.disconnect();
    wait_for_state(&client, ClientState::Disconnected).await;
}

#[tokio::test]
async fn test_client_with_bad_credentials_needs_action() {
    let state = AppState::in_memory(settings());
    let addr = start_gateway(state.clone()).await;

    let client = client(addr, "not-the-secret");
    client.start();

    timeout(
        Duration::from_secs(10),
        client
            .watch_status()
            .wait_for(|s| s.state == ClientState::Disconnected && s.last_error.is_some()),
    )
    .await
    .expect("client never gave up")
    .unwrap();

    let error = client.status().last_error.unwrap();
    assert_eq!(error.code(), "INVALID_CREDENTIALS");
    assert!(!error.will_retry());
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_client_waits_out_server_shutdown() {
    let mut settings = settings();
    settings.shutdown.grace_ms = 100;
    settings.shutdown.reconnect_delay_ms = 300;
    let state = AppState::in_memory(settings);
    let addr = start_gateway(state.clone()).await;

    let client = client(addr, DEVICE_SECRET);
    let mut events = client.subscribe_events();
    client.start();
    wait_for_state(&client, ClientState::Connected).await;

    let result = state.shutdown.execute("test").await;
    assert_eq!(result.clients_notified, 1);

    match next_matching(&mut events, |e| matches!(e, ClientEvent::ServerShutdown { .. })).await {
        ClientEvent::ServerShutdown { reconnect_delay_ms } => assert_eq!(reconnect_delay_ms, 300),
        _ => unreachable!(),
    }
    next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;

    // The draining gateway refuses the upgrade; the client keeps retrying
    wait_for_state(&client, ClientState::Reconnecting).await;
    let status = client.status();
    assert!(status.last_error.map(|e| e.will_retry()).unwrap_or(true));
}
