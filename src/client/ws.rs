//! Websocket transport for the client, on `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{Frame, HandshakeAuth, OpenPayload, Packet};

use super::{ClientError, Connector, Link, LinkPeer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a gateway's `/realtime` endpoint.
pub struct WsConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, auth: &HandshakeAuth) -> Result<Link, ClientError> {
        timeout(self.handshake_timeout, handshake(&self.url, auth))
            .await
            .unwrap_or(Err(ClientError::HandshakeTimeout))
    }
}

#[tracing::instrument(name = "client.handshake", skip(auth), fields(tenant_id = %auth.tenant_id()))]
async fn handshake(url: &str, auth: &HandshakeAuth) -> Result<Link, ClientError> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let open = loop {
        match next_frame(&mut socket).await? {
            Frame::Open(open) => break open,
            Frame::Ping => send(&mut socket, Frame::Pong).await?,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected open, got {}",
                    other.type_name()
                )))
            }
        }
    };

    send(
        &mut socket,
        Frame::Message(Packet::Connect {
            namespace: auth.namespace_path().to_string(),
            payload: Some(auth.to_payload()),
        }),
    )
    .await?;

    let connection_id = loop {
        match next_frame(&mut socket).await? {
            Frame::Ping => send(&mut socket, Frame::Pong).await?,
            Frame::Message(Packet::Connect { payload, .. }) => {
                break payload
                    .as_ref()
                    .and_then(|p| p.get("sid"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ClientError::Protocol("connect reply without sid".into()))?;
            }
            Frame::Message(Packet::ConnectError { error, .. }) => {
                return Err(ClientError::Rejected(error));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected {} during handshake",
                    other.type_name()
                )))
            }
        }
    };

    tracing::debug!(connection_id = %connection_id, "Handshake accepted");

    let (link, peer) = Link::pair(connection_id);
    tokio::spawn(drive(socket, peer, liveness_window(&open)));
    Ok(link)
}

/// The server pings every `pingInterval`; silence for longer than
/// `pingInterval + pingTimeout` means the link is gone.
fn liveness_window(open: &OpenPayload) -> Duration {
    Duration::from_millis(open.ping_interval.saturating_add(open.ping_timeout))
}

async fn drive(socket: Socket, mut peer: LinkPeer, liveness: Duration) {
    let (mut sink, mut stream) = socket.split();
    let deadline = sleep(liveness);
    tokio::pin!(deadline);

    let end = loop {
        tokio::select! {
            packet = peer.from_client.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = sink.send(text(Frame::Message(packet))).await {
                        break Some(ClientError::Transport(e.to_string()));
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break None;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(body))) => match Frame::decode(body.as_str()) {
                    Ok(Frame::Ping) => {
                        deadline.as_mut().reset(Instant::now() + liveness);
                        if let Err(e) = sink.send(text(Frame::Pong)).await {
                            break Some(ClientError::Transport(e.to_string()));
                        }
                    }
                    Ok(Frame::Message(packet)) => {
                        if peer.to_client.send(Ok(packet)).is_err() {
                            let _ = sink.close().await;
                            break None;
                        }
                    }
                    Ok(Frame::Close) => break Some(ClientError::Closed {
                        code: 1000,
                        reason: "server closed".to_string(),
                    }),
                    Ok(Frame::Pong | Frame::Open(_)) => {}
                    Err(e) => tracing::debug!(error = %e, "Dropping malformed frame from server"),
                },
                Some(Ok(Message::Close(frame))) => break Some(closed_error(frame)),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(ClientError::Transport(e.to_string())),
                None => break Some(ClientError::Transport("socket closed".to_string())),
            },
            _ = &mut deadline => {
                let _ = sink.close().await;
                break Some(ClientError::HeartbeatTimeout);
            }
            _ = peer.to_client.closed() => {
                let _ = sink.close().await;
                break None;
            }
        }
    };

    if let Some(error) = end {
        tracing::debug!(error = %error, "Link ended");
        let _ = peer.to_client.send(Err(error));
    }
}

async fn next_frame(socket: &mut Socket) -> Result<Frame, ClientError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(body))) => {
                return Frame::decode(body.as_str()).map_err(|e| ClientError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Close(frame))) => return Err(closed_error(frame)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
            None => {
                return Err(ClientError::Transport(
                    "socket closed during handshake".to_string(),
                ))
            }
        }
    }
}

async fn send(socket: &mut Socket, frame: Frame) -> Result<(), ClientError> {
    socket
        .send(text(frame))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))
}

fn text(frame: Frame) -> Message {
    Message::Text(frame.encode().into())
}

fn closed_error(frame: Option<CloseFrame>) -> ClientError {
    match frame {
        Some(frame) => ClientError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => ClientError::Closed {
            code: 1005,
            reason: String::new(),
        },
    }
}
