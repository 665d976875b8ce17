use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{future, SinkExt, StreamExt};

use crate::server::AppState;

use super::session::{serve_connection, WireMessage};

/// WebSocket upgrade handler for `GET /realtime`.
///
/// Authentication happens inside the socket with the CONNECT packet; the
/// upgrade itself only checks the origin and the drain flag.
#[tracing::instrument(name = "ws.upgrade", skip(ws, state, headers))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.settings.server.allowed_origins, origin) {
        tracing::warn!(origin = ?origin, "Rejected websocket upgrade from disallowed origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.max_message_size(state.settings.transport.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// An empty allow-list accepts every origin, including none.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allowed
            .iter()
            .any(|a| a == "*" || a.eq_ignore_ascii_case(origin)),
        None => false,
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();

    let inbound = stream
        .take_while(|result| {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Websocket read failed");
            }
            future::ready(result.is_ok())
        })
        .filter_map(|result| future::ready(result.ok().and_then(from_axum)))
        .boxed();

    let outbound = Box::pin(sink.with(|message: WireMessage| {
        future::ready(Ok::<_, axum::Error>(to_axum(message)))
    }));

    serve_connection(state, inbound, outbound).await;
}

fn from_axum(message: Message) -> Option<WireMessage> {
    match message {
        Message::Text(text) => Some(WireMessage::Text(text.to_string())),
        Message::Binary(data) => Some(WireMessage::Binary(data.to_vec())),
        Message::Close(frame) => Some(WireMessage::Close {
            code: frame.as_ref().map(|f| f.code),
            reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
        }),
        // Control frames are answered by the websocket library
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_axum(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(data) => Message::Binary(data.into()),
        WireMessage::Close { code, reason } => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_check() {
        assert!(origin_allowed(&[], None));
        assert!(origin_allowed(&[], Some("https://evil.example")));

        let allowed = vec!["https://app.example".to_string()];
        assert!(origin_allowed(&allowed, Some("https://app.example")));
        assert!(!origin_allowed(&allowed, Some("https://evil.example")));
        assert!(!origin_allowed(&allowed, None));
    }

    #[test]
    fn test_close_frame_conversion() {
        let message = to_axum(WireMessage::Close {
            code: Some(4008),
            reason: "backpressure".into(),
        });
        match from_axum(message) {
            Some(WireMessage::Close { code, reason }) => {
                assert_eq!(code, Some(4008));
                assert_eq!(reason, "backpressure");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(from_axum(Message::Ping(Default::default())).is_none());
    }
}
