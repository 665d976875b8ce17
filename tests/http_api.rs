//! HTTP surface: health, delivery and presence endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tower::ServiceExt;

use ara_realtime_gateway::protocol::Packet;
use ara_realtime_gateway::server::{create_app, AppState};

use common::{connect_device, join, settings, TENANT};

const API_KEY: &str = "collab-key";

fn gateway() -> (AppState, Router) {
    gateway_with_ack_timeout(10_000)
}

fn gateway_with_ack_timeout(ack_timeout_ms: u64) -> (AppState, Router) {
    let mut settings = settings();
    settings.api.key = Some(API_KEY.to_string());
    settings.transport.ack_timeout_ms = ack_timeout_ms;
    let state = AppState::in_memory(settings);
    let app = create_app(state.clone());
    (state, app)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("X-API-Key", API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_in_memory_node() {
    let (_, app) = gateway();
    let response = assert_ok!(
        app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
    );
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["draining"], false);
    assert_eq!(body["redis"]["status"], "disabled");
    assert_eq!(body["connections"]["total"], 0);
}

#[tokio::test]
async fn test_collaborator_endpoints_require_api_key() {
    let (_, app) = gateway();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/presence/query")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "tenantId": TENANT, "deviceIds": [] }).to_string()))
        .unwrap();

    let response = assert_ok!(app.oneshot(request).await);
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_room_delivery_reaches_joined_device() {
    let (state, app) = gateway();
    let mut device = connect_device(&state, "d1").await;
    join(&mut device, "", 1, "conv-1").await;

    let response = app
        .oneshot(post(
            "/api/v1/deliver/room",
            json!({
                "tenantId": TENANT,
                "roomId": "conv-1",
                "event": "message.new",
                "args": [{ "roomId": "conv-1", "id": "m-7" }]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["localDelivered"], 1);

    let (event, _) = device.recv_event_named("message.new").await;
    assert_eq!(event.payload(), Some(&json!({ "roomId": "conv-1", "id": "m-7" })));
}

#[tokio::test]
async fn test_room_delivery_validates_input() {
    let (_, app) = gateway();
    let response = app
        .oneshot(post(
            "/api/v1/deliver/room",
            json!({ "tenantId": TENANT, "roomId": "conv-1", "event": "" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_presence_query_and_tenant_stats() {
    let (state, app) = gateway();
    let _device = connect_device(&state, "d1").await;

    let response = app
        .clone()
        .oneshot(post(
            "/api/v1/presence/query",
            json!({ "tenantId": TENANT, "deviceIds": ["d1", "d2"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["devices"], json!({ "d1": true, "d2": false }));

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/tenants/{}/stats", TENANT))
                .header("X-API-Key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["total_connections"], 1);
    assert_eq!(body["unique_devices"], 1);
}

#[tokio::test]
async fn test_acknowledged_device_delivery_returns_reply() {
    let (state, app) = gateway();
    let mut device = connect_device(&state, "d1").await;

    let request = tokio::spawn(app.oneshot(post(
        "/api/v1/deliver/device",
        json!({
            "tenantId": TENANT,
            "deviceId": "d1",
            "event": "config.push",
            "args": [{ "version": 3 }],
            "ack": true
        }),
    )));

    let ack_id = match device.recv_packet().await {
        Packet::Event { ack_id: Some(ack_id), event, .. } => {
            assert_eq!(event.name, "config.push");
            ack_id
        }
        other => panic!("expected event with ack id, got {:?}", other),
    };
    device.send(&format!(r#"43{}[{{"applied":true}}]"#, ack_id));

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["localDelivered"], 1);
    assert_eq!(body["published"], false);
    assert_eq!(body["acks"][0]["args"], json!([{ "applied": true }]));
}

#[tokio::test]
async fn test_acknowledged_delivery_reports_timeout() {
    let (state, app) = gateway_with_ack_timeout(50);
    let _device = connect_device(&state, "d1").await;

    let response = app
        .oneshot(post(
            "/api/v1/deliver/device",
            json!({ "tenantId": TENANT, "deviceId": "d1", "event": "config.push", "ack": true }),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["localDelivered"], 0);
    assert!(body["acks"][0]["error"].as_str().unwrap().contains("timed out"));

    // The timed-out wait left nothing behind on the connection
    let handle = state.registry.all().pop().unwrap();
    assert_eq!(handle.acks().pending_count(), 0);
}
