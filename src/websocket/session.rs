//! One realtime connection from OPEN to cleanup.
//!
//! The session is transport-agnostic: it reads [`WireMessage`]s from a stream
//! and writes them to a sink, so the axum upgrade handler and tests drive the
//! same code. Each connection runs two tasks: this reader and a writer that
//! drains the outbound queue.

use std::fmt::Display;
use std::future::pending;
use std::sync::Arc;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::cluster::DeliveryTarget;
use crate::connection_manager::{
    AckError, CloseReason, CloseSignal, ConnectionHandle, ConnectionIdentity, ConnectionState,
    Namespace, OutboundFrame, OutboundQueue, OutboundReceiver,
};
use crate::error::TransportError;
use crate::metrics::TransportMetrics;
use crate::presence::PresenceTransition;
use crate::protocol::{
    ConnectErrorCode, ConnectErrorPayload, Frame, OpenPayload, Packet, ProtocolError,
    ViolationBudget,
};
use crate::server::AppState;

use super::events::ServerEvent;
use super::inbound;

/// A websocket message, independent of the websocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

/// Run a connection until it closes.
#[tracing::instrument(
    name = "ws.session",
    skip_all,
    fields(connection_id = tracing::field::Empty, otel.kind = "server")
)]
pub async fn serve_connection<S, K>(state: AppState, mut inbound: S, outbound: K)
where
    S: Stream<Item = WireMessage> + Unpin + Send,
    K: Sink<WireMessage> + Unpin + Send + 'static,
    K::Error: Display + Send,
{
    let transport = &state.settings.transport;
    let connection_id = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));

    let (queue, rx) = OutboundQueue::channel(transport.max_buffered_bytes);
    let close = CloseSignal::new();
    let mut writer = tokio::spawn(write_loop(outbound, rx, close.clone()));

    let _ = queue.push(
        Frame::Open(OpenPayload {
            sid: connection_id.to_string(),
            ping_interval: transport.ping_interval_ms,
            ping_timeout: transport.ping_timeout_ms,
        })
        .encode(),
    );

    let mut violations = ViolationBudget::new(transport.max_protocol_violations);
    let handshake_result = timeout(
        transport.handshake_timeout(),
        handshake(&state, &mut inbound, &queue, &mut violations),
    )
    .await
    .unwrap_or(Err(TransportError::HandshakeTimeout));

    let identity = match handshake_result {
        Ok(identity) => identity,
        Err(e) => {
            let reason = e.close_reason().unwrap_or(CloseReason::TransportError);
            tracing::info!(reason = %reason, error = %e, "Connection closed during handshake");
            TransportMetrics::handshake_closed(reason.as_str());
            finish_writer(&state, &queue, &mut writer, reason).await;
            return;
        }
    };

    let handle = Arc::new(ConnectionHandle::new(
        connection_id,
        identity,
        queue.clone(),
        close.clone(),
    ));
    handle.set_state(ConnectionState::Open);

    if let Err(e) = state.registry.register(handle.clone()) {
        tracing::warn!(
            tenant_id = %handle.tenant_id(),
            principal = %handle.identity.principal,
            error = %e,
            "Connection rejected"
        );
        TransportMetrics::record_handshake("rejected");
        TransportMetrics::handshake_closed(CloseReason::AuthFailed.as_str());
        handle.set_state(ConnectionState::Closed);
        let _ = queue.push(
            Frame::Message(Packet::ConnectError {
                namespace: handle.namespace().path().to_string(),
                error: ConnectErrorPayload::new(ConnectErrorCode::AuthError, e.to_string()),
            })
            .encode(),
        );
        finish_writer(&state, &queue, &mut writer, CloseReason::AuthFailed).await;
        return;
    }

    open_session(&state, &handle).await;

    let reason = run(&state, &handle, &mut inbound, &mut violations).await;

    close_session(&state, &handle, reason).await;
    finish_writer(&state, &queue, &mut writer, reason).await;
}

/// Wait for a CONNECT packet and authenticate it.
async fn handshake<S>(
    state: &AppState,
    inbound: &mut S,
    queue: &OutboundQueue,
    violations: &mut ViolationBudget,
) -> Result<ConnectionIdentity, TransportError>
where
    S: Stream<Item = WireMessage> + Unpin,
{
    let max_frame_bytes = state.settings.transport.max_frame_bytes;

    while let Some(message) = inbound.next().await {
        let text = match message {
            WireMessage::Text(text) => text,
            WireMessage::Binary(_) => {
                violation(violations, ProtocolError::BinaryFrame)?;
                continue;
            }
            WireMessage::Close { .. } => return Err(TransportError::PeerClosed),
        };

        let frame = match Frame::decode_bounded(&text, max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                violation(violations, e)?;
                continue;
            }
        };

        match frame {
            Frame::Ping => {
                let _ = queue.push(Frame::Pong.encode());
            }
            Frame::Pong => {}
            Frame::Close => return Err(TransportError::PeerClosed),
            Frame::Message(Packet::Connect { namespace, payload }) => {
                if state.shutdown.is_draining() {
                    return Err(TransportError::Draining);
                }
                return match state
                    .authenticator
                    .authenticate(&namespace, payload.as_ref())
                    .await
                {
                    Ok(identity) => Ok(identity),
                    Err(error) => {
                        tracing::info!(
                            namespace = %namespace,
                            code = %error.code,
                            "Handshake rejected"
                        );
                        TransportMetrics::record_handshake("rejected");
                        let _ = queue.push(
                            Frame::Message(Packet::ConnectError {
                                namespace,
                                error: error.clone(),
                            })
                            .encode(),
                        );
                        Err(TransportError::Auth(error))
                    }
                };
            }
            Frame::Message(packet) => {
                violation(violations, ProtocolError::Unexpected(packet.kind().as_str()))?;
            }
            Frame::Open(_) => {
                violation(violations, ProtocolError::Unexpected("OPEN"))?;
            }
        }
    }

    Err(TransportError::PeerClosed)
}

/// Count a protocol violation; fails once the budget is exhausted.
fn violation(budget: &mut ViolationBudget, error: ProtocolError) -> Result<(), TransportError> {
    TransportMetrics::record_violation(error.label());
    if budget.record() {
        tracing::warn!(
            violations = budget.count(),
            error = %error,
            "Protocol violation budget exhausted"
        );
        return Err(TransportError::Protocol(error));
    }
    tracing::debug!(error = %error, "Dropping malformed frame");
    Ok(())
}

/// Post-handshake bookkeeping and announcements.
async fn open_session(state: &AppState, handle: &Arc<ConnectionHandle>) {
    let tenant_id = handle.tenant_id();
    let namespace = handle.namespace();

    state.router.track_tenant(tenant_id);

    let _ = handle.send_packet(Packet::Connect {
        namespace: namespace.path().to_string(),
        payload: Some(json!({ "sid": handle.id })),
    });
    let _ = handle.emit(ServerEvent::connected(handle.id));

    TransportMetrics::record_handshake("accepted");
    TransportMetrics::connection_opened(namespace.as_str());

    tracing::info!(
        tenant_id = %tenant_id,
        principal = %handle.identity.principal,
        namespace = namespace.as_str(),
        "Realtime connection established"
    );

    match namespace {
        Namespace::Admin => {
            if let Err(e) = state.router.join_tenant_admins(handle) {
                tracing::warn!(error = %e, "Failed to join tenant admin room");
            }
        }
        Namespace::Client => {
            if let Some(device) = handle.identity.device_key() {
                let transition = state.presence.connection_opened(&device, handle.id).await;
                if transition == PresenceTransition::CameOnline {
                    state
                        .router
                        .deliver_to_tenant_admins(
                            tenant_id,
                            ServerEvent::presence_changed(&device.device_id, true),
                        )
                        .await;
                }
            }
        }
    }

    state
        .router
        .deliver(
            tenant_id,
            DeliveryTarget::admin_room(tenant_id),
            ServerEvent::session_connect(handle),
            vec![handle.id],
        )
        .await;
}

async fn pong_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Read loop for an open connection. Returns why it ended.
async fn run<S>(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    inbound: &mut S,
    violations: &mut ViolationBudget,
) -> CloseReason
where
    S: Stream<Item = WireMessage> + Unpin,
{
    let transport = &state.settings.transport;
    let close = handle.close_signal().clone();
    let mut close_rx = close.subscribe();

    let ping_interval = transport.ping_interval();
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        if let Some(reason) = close.reason() {
            return reason;
        }

        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() {
                    return CloseReason::TransportError;
                }
            }
            _ = ping.tick() => {
                if awaiting_pong.is_none() {
                    let _ = handle.send_frame(&Frame::Ping);
                    awaiting_pong = Some(Instant::now() + transport.ping_timeout());
                }
            }
            _ = pong_deadline(awaiting_pong) => {
                tracing::info!(
                    last_seen_at = %handle.last_seen_at(),
                    "No pong within heartbeat timeout"
                );
                close.close(CloseReason::HeartbeatTimeout);
            }
            message = inbound.next() => {
                let Some(message) = message else {
                    close.close(CloseReason::ClientClosed);
                    continue;
                };
                if let Err(e) = on_message(state, handle, violations, message, &mut awaiting_pong).await {
                    close.close(e.close_reason().unwrap_or(CloseReason::TransportError));
                }
            }
        }
    }
}

async fn on_message(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    violations: &mut ViolationBudget,
    message: WireMessage,
    awaiting_pong: &mut Option<Instant>,
) -> Result<(), TransportError> {
    let text = match message {
        WireMessage::Text(text) => text,
        WireMessage::Binary(_) => return violation(violations, ProtocolError::BinaryFrame),
        WireMessage::Close { .. } => return Err(TransportError::PeerClosed),
    };
    handle.touch();

    let frame = match Frame::decode_bounded(&text, state.settings.transport.max_frame_bytes) {
        Ok(frame) => frame,
        Err(e) => return violation(violations, e),
    };

    let packet = match frame {
        Frame::Pong => {
            *awaiting_pong = None;
            return Ok(());
        }
        Frame::Ping => {
            handle.send_frame(&Frame::Pong)?;
            return Ok(());
        }
        Frame::Close => return Err(TransportError::PeerClosed),
        Frame::Open(_) => return violation(violations, ProtocolError::Unexpected("OPEN")),
        Frame::Message(packet) => packet,
    };

    let namespace = handle.namespace();
    if Namespace::from_path(packet.namespace()) != Some(namespace) {
        return violation(
            violations,
            ProtocolError::NamespaceMismatch {
                expected: namespace.path(),
                got: packet.namespace().to_string(),
            },
        );
    }

    match packet {
        Packet::Event { ack_id, event, .. } => {
            inbound::handle_event(state, handle, ack_id, event).await;
        }
        Packet::Ack { ack_id, args, .. } => {
            if !handle.acks().resolve(ack_id, args) {
                tracing::debug!(ack_id = ack_id, "ACK for unknown or expired id");
            }
        }
        Packet::Disconnect { .. } => return Err(TransportError::PeerClosed),
        other => return violation(violations, ProtocolError::Unexpected(other.kind().as_str())),
    }
    Ok(())
}

/// Release everything the connection held and announce the disconnect.
async fn close_session(state: &AppState, handle: &Arc<ConnectionHandle>, reason: CloseReason) {
    let tenant_id = handle.tenant_id();
    let disconnected_at = Utc::now();

    handle.set_state(ConnectionState::Closed);
    let cancelled_acks = handle.acks().fail_all(AckError::ConnectionClosed);
    let rooms_left = state.router.remove_connection(handle.id);
    state.registry.unregister(handle.id);

    if let Some(device) = handle.identity.device_key() {
        let transition = state.presence.connection_closed(&device, handle.id).await;
        if transition == PresenceTransition::WentOffline {
            state
                .router
                .deliver_to_tenant_admins(
                    tenant_id,
                    ServerEvent::presence_changed(&device.device_id, false),
                )
                .await;
        }
    }

    state
        .router
        .deliver(
            tenant_id,
            DeliveryTarget::admin_room(tenant_id),
            ServerEvent::session_disconnect(handle, reason, disconnected_at),
            vec![handle.id],
        )
        .await;
    state.router.release_tenant(tenant_id);

    TransportMetrics::connection_closed(handle.namespace().as_str(), reason.as_str());

    tracing::info!(
        tenant_id = %tenant_id,
        principal = %handle.identity.principal,
        reason = %reason,
        close_code = reason.code(),
        rooms_left = rooms_left,
        cancelled_acks = cancelled_acks,
        duration_ms = (disconnected_at - handle.connected_at).num_milliseconds(),
        "Realtime connection closed"
    );
}

/// Queue the close frame and give the writer a bounded time to flush it.
async fn finish_writer(
    state: &AppState,
    queue: &OutboundQueue,
    writer: &mut JoinHandle<()>,
    reason: CloseReason,
) {
    let _ = queue.push_close(reason);
    if timeout(state.settings.shutdown.close_timeout(), &mut *writer)
        .await
        .is_err()
    {
        tracing::debug!("Writer did not finish in time, aborting");
        writer.abort();
    }
}

/// Drain the outbound queue into the socket.
async fn write_loop<K>(mut sink: K, mut rx: OutboundReceiver, close: CloseSignal)
where
    K: Sink<WireMessage> + Unpin,
    K::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                let len = text.len();
                if rx.discarding() {
                    rx.release(len);
                    continue;
                }
                let result = sink.send(WireMessage::Text(text)).await;
                rx.release(len);
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Websocket write failed");
                    close.close(CloseReason::TransportError);
                    break;
                }
            }
            OutboundFrame::Close(reason) => {
                let _ = sink
                    .send(WireMessage::Close {
                        code: Some(reason.code()),
                        reason: reason.as_str().to_string(),
                    })
                    .await;
                let _ = sink.close().await;
                break;
            }
        }
    }
    rx.close();
}
