//! Reconnection controller.
//!
//! A background driver task owns the current [`Link`] and walks the
//! [`ClientState`] table: it connects, backs off between failed attempts,
//! honours `server.shutdown` delays and re-joins rooms after every reconnect.
//! [`RealtimeClient`] is the handle callers hold; it talks to the driver over
//! a command channel and reads state from a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use crate::backoff::{jitter_above, BackoffConfig, ExponentialBackoff};
use crate::connection_manager::{AckError, AckRegistry};
use crate::protocol::{EventMessage, HandshakeAuth, Packet};
use crate::rooms::MESSAGE_NEW_EVENT;
use crate::websocket::events::SERVER_SHUTDOWN;

use super::state::{transition, ClientInput};
use super::{ClientError, ClientState, ClientStatus, Connector, Link};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub auth: HandshakeAuth,
    pub backoff: BackoffConfig,
    pub ack_timeout: Duration,
    /// Upper bound of the extra delay added to a server-advertised reconnect delay
    pub shutdown_jitter: f64,
}

impl ClientConfig {
    pub fn new(auth: HandshakeAuth) -> Self {
        Self {
            auth,
            backoff: BackoffConfig::reconnect(),
            ack_timeout: Duration::from_secs(10),
            shutdown_jitter: 0.2,
        }
    }
}

/// Notifications for code built on the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { connection_id: String },
    Disconnected { error: Option<ClientError> },
    /// A room was joined again after a reconnect; fetch events after `cursor`.
    Rejoined { room_id: String, cursor: Option<String> },
    ServerShutdown { reconnect_delay_ms: u64 },
    Event(EventMessage),
}

#[derive(Debug, Clone)]
struct JoinedRoom {
    room_id: String,
    cursor: Option<String>,
}

#[derive(Debug)]
enum Command {
    Start,
    Pause,
    Resume,
    Disconnect,
}

struct Shared {
    namespace: &'static str,
    /// Device connections focus on one room at a time
    single_room: bool,
    link: watch::Sender<Option<mpsc::UnboundedSender<Packet>>>,
    acks: AckRegistry,
    rooms: Mutex<Vec<JoinedRoom>>,
    events: broadcast::Sender<ClientEvent>,
    ack_timeout: Duration,
}

impl Shared {
    fn send(&self, packet: Packet) -> Result<(), ClientError> {
        let sender = self.link.borrow().clone().ok_or(ClientError::NotConnected)?;
        sender.send(packet).map_err(|_| ClientError::NotConnected)
    }

    async fn emit_with_ack(&self, event: EventMessage) -> Result<Vec<Value>, ClientError> {
        let waiter = self.acks.register(self.ack_timeout);
        let ack_id = waiter.ack_id();
        let packet = Packet::Event {
            namespace: self.namespace.to_string(),
            ack_id: Some(ack_id),
            event,
        };
        if let Err(e) = self.send(packet) {
            self.acks.forget(ack_id);
            return Err(e);
        }
        Ok(waiter.wait().await?)
    }

    /// Send `join` and return the cursor from the server's reply.
    async fn join(&self, room_id: &str, cursor: Option<String>) -> Result<Option<String>, ClientError> {
        let reply = self
            .emit_with_ack(EventMessage::with_payload(
                "join",
                json!({ "roomId": room_id, "cursor": cursor }),
            ))
            .await?;
        let reply = reply.into_iter().next().unwrap_or(Value::Null);
        if let Some(error) = reply.get("error") {
            return Err(server_error(error));
        }
        Ok(reply
            .get("cursor")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn remember_room(&self, room_id: &str, cursor: Option<String>) {
        let mut rooms = self.rooms.lock().await;
        if self.single_room {
            rooms.clear();
        }
        rooms.retain(|r| r.room_id != room_id);
        rooms.push(JoinedRoom {
            room_id: room_id.to_string(),
            cursor,
        });
    }

    async fn advance_cursor(&self, room_id: Option<&str>, id: String) {
        let mut rooms = self.rooms.lock().await;
        let room = match room_id {
            Some(room_id) => rooms.iter_mut().find(|r| r.room_id == room_id),
            None if self.single_room => rooms.first_mut(),
            None => None,
        };
        if let Some(room) = room {
            room.cursor = Some(id);
        }
    }
}

fn server_error(error: &Value) -> ClientError {
    let field = |name: &str| {
        error
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    ClientError::Server {
        code: field("code"),
        message: field("message"),
    }
}

/// Handle to a reconnecting realtime connection.
///
/// Must be created inside a Tokio runtime. Dropping the last handle stops the
/// driver task.
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    shared: Arc<Shared>,
}

impl RealtimeClient {
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            namespace: config.auth.namespace_path(),
            single_room: matches!(config.auth, HandshakeAuth::Device { .. }),
            link,
            acks: AckRegistry::new(),
            rooms: Mutex::new(Vec::new()),
            events,
            ack_timeout: config.ack_timeout,
        });

        let driver = Driver {
            connector,
            auth: config.auth,
            shared: shared.clone(),
            commands: command_rx,
            status: status_tx,
            backoff: ExponentialBackoff::with_config(config.backoff),
            shutdown_jitter: config.shutdown_jitter,
            advertised_delay: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands,
            status,
            shared,
        }
    }

    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Close the connection and stop reconnecting. Pending acks fail with
    /// [`AckError::Cancelled`].
    pub fn disconnect(&self) {
        self.shared.acks.fail_all(AckError::Cancelled);
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Drop the live link and hold further attempts until [`Self::resume`].
    pub fn pause(&self) {
        self.shared.acks.fail_all(AckError::Cancelled);
        let _ = self.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    /// Join a room, returning the cursor the server holds for it. The room
    /// is re-joined automatically after every reconnect.
    pub async fn join_room(
        &self,
        room_id: &str,
        cursor: Option<String>,
    ) -> Result<Option<String>, ClientError> {
        let cursor = self.shared.join(room_id, cursor).await?;
        self.shared.remember_room(room_id, cursor.clone()).await;
        Ok(cursor)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
        self.shared
            .rooms
            .lock()
            .await
            .retain(|r| r.room_id != room_id);
        let reply = self
            .shared
            .emit_with_ack(EventMessage::with_payload("leave", json!({ "roomId": room_id })))
            .await?;
        match reply.first().and_then(|v| v.get("error")) {
            Some(error) => Err(server_error(error)),
            None => Ok(()),
        }
    }

    pub fn emit(&self, event: EventMessage) -> Result<(), ClientError> {
        self.shared.send(Packet::Event {
            namespace: self.shared.namespace.to_string(),
            ack_id: None,
            event,
        })
    }

    pub async fn emit_with_ack(&self, event: EventMessage) -> Result<Vec<Value>, ClientError> {
        self.shared.emit_with_ack(event).await
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }
}

enum Step {
    Serve(Link),
    Continue,
    Exit,
}

struct Driver {
    connector: Arc<dyn Connector>,
    auth: HandshakeAuth,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ClientStatus>,
    backoff: ExponentialBackoff,
    shutdown_jitter: f64,
    /// Replaces the next backoff delay after `server.shutdown`
    advertised_delay: Option<Duration>,
}

impl Driver {
    fn state(&self) -> ClientState {
        self.status.borrow().state
    }

    fn paused(&self) -> bool {
        self.status.borrow().paused
    }

    fn apply(&self, input: ClientInput) {
        let current = self.state();
        if let Some(next) = transition(current, input) {
            self.status.send_modify(|s| s.state = next);
            tracing::debug!(from = %current, to = %next, input = ?input, "Client state changed");
        }
    }

    fn set_error(&self, error: Option<ClientError>) {
        self.status.send_modify(|s| s.last_error = error);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                if self.state() == ClientState::Disconnected {
                    self.backoff.reset();
                    self.set_error(None);
                }
                self.apply(ClientInput::Start);
            }
            Command::Pause => self.status.send_modify(|s| s.paused = true),
            Command::Resume => {
                self.status.send_modify(|s| s.paused = false);
                self.apply(ClientInput::Retry);
            }
            Command::Disconnect => {
                self.advertised_delay = None;
                self.apply(ClientInput::Stop);
            }
        }
    }

    async fn run(mut self) {
        loop {
            let state = self.state();
            if state == ClientState::Disconnected || self.paused() {
                match self.commands.recv().await {
                    Some(command) => self.on_command(command),
                    None => return,
                }
                continue;
            }

            let step = match state {
                ClientState::Connecting => self.attempt().await,
                ClientState::Reconnecting => self.wait_before_retry().await,
                // Connected only exists inside `serve`
                ClientState::Connected | ClientState::Disconnected => Step::Continue,
            };

            match step {
                Step::Serve(link) => {
                    if let Step::Exit = self.serve(link).await {
                        return;
                    }
                }
                Step::Continue => {}
                Step::Exit => return,
            }
        }
    }

    async fn attempt(&mut self) -> Step {
        let connector = self.connector.clone();
        let auth = self.auth.clone();
        let attempt = async move { connector.connect(&auth).await };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return self.on_attempt_result(result),
                command = self.commands.recv() => {
                    let Some(command) = command else { return Step::Exit };
                    self.on_command(command);
                    if self.state() != ClientState::Connecting || self.paused() {
                        tracing::debug!("Connect attempt cancelled");
                        return Step::Continue;
                    }
                }
            }
        }
    }

    fn on_attempt_result(&mut self, result: Result<Link, ClientError>) -> Step {
        match result {
            Ok(link) => {
                self.backoff.reset();
                self.set_error(None);
                self.apply(ClientInput::Established);
                Step::Serve(link)
            }
            Err(error) => {
                let will_retry = error.will_retry();
                tracing::warn!(
                    error = %error,
                    code = error.code(),
                    will_retry = will_retry,
                    "Connect attempt failed"
                );
                self.set_error(Some(error.clone()));
                if will_retry {
                    self.apply(ClientInput::Dropped);
                } else {
                    self.apply(ClientInput::Fatal);
                    let _ = self.shared.events.send(ClientEvent::Disconnected {
                        error: Some(error),
                    });
                }
                Step::Continue
            }
        }
    }

    async fn wait_before_retry(&mut self) -> Step {
        let delay = match self.advertised_delay.take() {
            Some(delay) => delay,
            None => self.backoff.next_delay(),
        };
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt(),
            "Reconnecting after delay"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.apply(ClientInput::Retry);
                    return Step::Continue;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { return Step::Exit };
                    self.on_command(command);
                    if self.state() != ClientState::Reconnecting || self.paused() {
                        return Step::Continue;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, link: Link) -> Step {
        let Link {
            connection_id,
            outbound,
            mut inbound,
        } = link;

        self.shared.link.send_replace(Some(outbound.clone()));
        tracing::info!(connection_id = %connection_id, "Client connected");
        let _ = self.shared.events.send(ClientEvent::Connected {
            connection_id: connection_id.clone(),
        });
        self.spawn_rejoin();

        let (step, error) = loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    Some(Ok(packet)) => {
                        if let Err(error) = self.on_packet(packet).await {
                            break (Step::Continue, Some(error));
                        }
                    }
                    Some(Err(error)) => break (Step::Continue, Some(error)),
                    None => break (Step::Continue, Some(ClientError::Transport("link closed".to_string()))),
                },
                command = self.commands.recv() => {
                    let Some(command) = command else { break (Step::Exit, None) };
                    self.on_command(command);
                    if self.state() != ClientState::Connected || self.paused() {
                        break (Step::Continue, None);
                    }
                }
            }
        };

        self.shared.link.send_replace(None);
        match &error {
            None => {
                let _ = outbound.send(Packet::Disconnect {
                    namespace: self.shared.namespace.to_string(),
                });
                self.shared.acks.fail_all(AckError::Cancelled);
            }
            Some(error) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %error,
                    "Connection lost"
                );
                self.shared.acks.fail_all(AckError::ConnectionClosed);
                self.set_error(Some(error.clone()));
            }
        }
        drop(outbound);
        drop(inbound);

        match &error {
            Some(e) if !e.will_retry() => self.apply(ClientInput::Fatal),
            _ => self.apply(ClientInput::Dropped),
        };
        let _ = self.shared.events.send(ClientEvent::Disconnected { error });
        step
    }

    fn spawn_rejoin(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let rooms = shared.rooms.lock().await.clone();
            for room in rooms {
                match shared.join(&room.room_id, room.cursor.clone()).await {
                    Ok(cursor) => {
                        if let Some(id) = cursor.clone() {
                            shared.advance_cursor(Some(&room.room_id), id).await;
                        }
                        tracing::debug!(room_id = %room.room_id, cursor = ?cursor, "Room re-joined");
                        let _ = shared.events.send(ClientEvent::Rejoined {
                            room_id: room.room_id,
                            cursor,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(room_id = %room.room_id, error = %e, "Failed to re-join room");
                    }
                }
            }
        });
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Event { event, .. } => {
                self.on_event(event).await;
                Ok(())
            }
            Packet::Ack { ack_id, args, .. } => {
                if !self.shared.acks.resolve(ack_id, args) {
                    tracing::debug!(ack_id = ack_id, "Ack for unknown or expired id");
                }
                Ok(())
            }
            Packet::Disconnect { .. } => Err(ClientError::Closed {
                code: 1000,
                reason: "disconnected by server".to_string(),
            }),
            Packet::ConnectError { error, .. } => Err(ClientError::Rejected(error)),
            Packet::Connect { .. } => Ok(()),
        }
    }

    async fn on_event(&mut self, event: EventMessage) {
        match event.name.as_str() {
            SERVER_SHUTDOWN => {
                let delay_ms = event
                    .payload()
                    .and_then(|p| p.get("reconnectDelayMs"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                self.advertised_delay = Some(jitter_above(
                    Duration::from_millis(delay_ms),
                    self.shutdown_jitter,
                ));
                tracing::info!(reconnect_delay_ms = delay_ms, "Server is shutting down");
                let _ = self.shared.events.send(ClientEvent::ServerShutdown {
                    reconnect_delay_ms: delay_ms,
                });
            }
            MESSAGE_NEW_EVENT => {
                if let Some(payload) = event.payload() {
                    let id = match payload.get("id") {
                        Some(Value::String(s)) => Some(s.clone()),
                        Some(Value::Number(n)) => Some(n.to_string()),
                        _ => None,
                    };
                    if let Some(id) = id {
                        let room_id = payload.get("roomId").and_then(Value::as_str);
                        self.shared.advance_cursor(room_id, id).await;
                    }
                }
            }
            _ => {}
        }
        let _ = self.shared.events.send(ClientEvent::Event(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LinkPeer;
    use crate::protocol::{ConnectErrorCode, ConnectErrorPayload};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Connector that replays a script of outcomes and hands the server side
    /// of every successful link to the test.
    struct ScriptedConnector {
        script: std::sync::Mutex<VecDeque<Result<(), ClientError>>>,
        attempts: mpsc::UnboundedSender<(Instant, Option<LinkPeer>)>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _auth: &HandshakeAuth) -> Result<Link, ClientError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(())) => {
                    let (link, peer) = Link::pair("conn");
                    let _ = self.attempts.send((Instant::now(), Some(peer)));
                    Ok(link)
                }
                Some(Err(e)) => {
                    let _ = self.attempts.send((Instant::now(), None));
                    Err(e)
                }
                None => {
                    let _ = self.attempts.send((Instant::now(), None));
                    std::future::pending().await
                }
            }
        }
    }

    type Attempts = mpsc::UnboundedReceiver<(Instant, Option<LinkPeer>)>;

    fn client(script: Vec<Result<(), ClientError>>) -> (RealtimeClient, Attempts) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ScriptedConnector {
            script: std::sync::Mutex::new(script.into()),
            attempts: tx,
        });
        let auth = HandshakeAuth::Device {
            tenant_id: "t1".to_string(),
            device_id: "d1".to_string(),
            credential: "secret".to_string(),
        };
        (RealtimeClient::new(connector, ClientConfig::new(auth)), rx)
    }

    fn refused() -> Result<(), ClientError> {
        Err(ClientError::Transport("connection refused".to_string()))
    }

    async fn wait_for_state(client: &RealtimeClient, state: ClientState) {
        client
            .watch_status()
            .wait_for(|s| s.state == state)
            .await
            .unwrap();
    }

    fn assert_near(actual: Duration, base_ms: u64) {
        let ms = actual.as_millis() as u64;
        assert!(
            ms >= base_ms * 9 / 10 && ms <= base_ms * 11 / 10,
            "{}ms not within 10% of {}ms",
            ms,
            base_ms
        );
    }

    /// Answer the next ack request on `peer` with `reply`.
    async fn answer_ack(peer: &mut LinkPeer, reply: Value) -> EventMessage {
        match peer.from_client.recv().await.unwrap() {
            Packet::Event {
                ack_id: Some(ack_id),
                event,
                ..
            } => {
                peer.to_client
                    .send(Ok(Packet::Ack {
                        namespace: "/".to_string(),
                        ack_id,
                        args: vec![reply],
                    }))
                    .unwrap();
                event
            }
            other => panic!("expected event with ack, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_resets_after_connect() {
        let (client, mut attempts) = client(vec![refused(), refused(), refused(), Ok(()), Ok(())]);
        client.start();

        let (t0, _) = attempts.recv().await.unwrap();
        let (t1, _) = attempts.recv().await.unwrap();
        let (t2, _) = attempts.recv().await.unwrap();
        let (t3, peer) = attempts.recv().await.unwrap();
        assert_near(t1 - t0, 1_000);
        assert_near(t2 - t1, 2_000);
        assert_near(t3 - t2, 4_000);

        wait_for_state(&client, ClientState::Connected).await;
        assert_eq!(client.status().last_error, None);

        let dropped_at = Instant::now();
        drop(peer);
        let (t4, _) = attempts.recv().await.unwrap();
        assert_near(t4 - dropped_at, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_shutdown_delay_is_never_shortened() {
        let (client, mut attempts) = client(vec![Ok(()), Ok(())]);
        let mut events = client.subscribe_events();
        client.start();

        let (_, peer) = attempts.recv().await.unwrap();
        let peer = peer.unwrap();
        wait_for_state(&client, ClientState::Connected).await;

        peer.to_client
            .send(Ok(Packet::event("/", EventMessage::with_payload(
                SERVER_SHUTDOWN,
                json!({ "reconnectDelayMs": 5000 }),
            ))))
            .unwrap();
        peer.to_client
            .send(Err(ClientError::Closed {
                code: 1000,
                reason: "server shutdown".to_string(),
            }))
            .unwrap();
        let closed_at = Instant::now();

        let (reconnected_at, _) = attempts.recv().await.unwrap();
        let waited = reconnected_at - closed_at;
        assert!(waited >= Duration::from_millis(5_000), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(6_000), "waited {:?}", waited);

        let mut saw_shutdown = false;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::ServerShutdown { reconnect_delay_ms } = event {
                assert_eq!(reconnect_delay_ms, 5000);
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_reconnect_uses_last_seen_cursor() {
        let (client, mut attempts) = client(vec![Ok(()), Ok(())]);
        let client = Arc::new(client);
        let mut events = client.subscribe_events();
        client.start();

        let (_, peer) = attempts.recv().await.unwrap();
        let mut peer = peer.unwrap();
        wait_for_state(&client, ClientState::Connected).await;

        let join = tokio::spawn({
            let client = client.clone();
            async move { client.join_room("room-1", None).await }
        });
        let request = answer_ack(&mut peer, json!({ "roomId": "room-1", "cursor": null })).await;
        assert_eq!(request.name, "join");
        assert_eq!(join.await.unwrap().unwrap(), None);

        peer.to_client
            .send(Ok(Packet::event("/", EventMessage::with_payload(
                "message.new",
                json!({ "roomId": "room-1", "id": "m-42" }),
            ))))
            .unwrap();
        peer.to_client
            .send(Err(ClientError::Transport("reset".to_string())))
            .unwrap();

        let (_, peer) = attempts.recv().await.unwrap();
        let mut peer = peer.unwrap();
        let rejoin = answer_ack(&mut peer, json!({ "roomId": "room-1", "cursor": "m-42" })).await;
        assert_eq!(rejoin.name, "join");
        assert_eq!(rejoin.payload().unwrap()["cursor"], "m-42");

        loop {
            if let ClientEvent::Rejoined { room_id, cursor } = events.recv().await.unwrap() {
                assert_eq!(room_id, "room-1");
                assert_eq!(cursor.as_deref(), Some("m-42"));
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cancels_pending_ack_and_holds_attempts() {
        let (client, mut attempts) = client(vec![Ok(()), Ok(())]);
        let client = Arc::new(client);
        client.start();

        let (_, peer) = attempts.recv().await.unwrap();
        let mut peer = peer.unwrap();
        wait_for_state(&client, ClientState::Connected).await;

        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .emit_with_ack(EventMessage::with_payload("typing", json!({ "roomId": "r" })))
                    .await
            }
        });
        assert!(matches!(
            peer.from_client.recv().await,
            Some(Packet::Event { ack_id: Some(_), .. })
        ));

        client.pause();
        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            ClientError::Ack(AckError::Cancelled)
        );
        assert!(matches!(
            peer.from_client.recv().await,
            Some(Packet::Disconnect { .. })
        ));
        assert!(peer.from_client.recv().await.is_none());

        wait_for_state(&client, ClientState::Reconnecting).await;
        assert!(client.status().paused);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(attempts.try_recv().is_err());

        client.resume();
        let (_, peer) = attempts.recv().await.unwrap();
        assert!(peer.is_some());
        wait_for_state(&client, ClientState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_credentials_stop_retrying() {
        let (client, mut attempts) = client(vec![Err(ClientError::Rejected(
            ConnectErrorPayload::new(ConnectErrorCode::InvalidCredentials, "bad secret"),
        ))]);
        client.start();

        attempts.recv().await.unwrap();
        wait_for_state(&client, ClientState::Disconnected).await;
        let error = client.status().last_error.unwrap();
        assert_eq!(error.code(), "INVALID_CREDENTIALS");
        assert!(!error.will_retry());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(attempts.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_during_session_stops_retrying() {
        let (client, mut attempts) = client(vec![Ok(()), Ok(())]);
        client.start();

        let (_, peer) = attempts.recv().await.unwrap();
        let peer = peer.unwrap();
        wait_for_state(&client, ClientState::Connected).await;

        peer.to_client
            .send(Ok(Packet::ConnectError {
                namespace: "/".to_string(),
                error: ConnectErrorPayload::new(ConnectErrorCode::InvalidCredentials, "revoked"),
            }))
            .unwrap();

        wait_for_state(&client, ClientState::Disconnected).await;
        assert_eq!(client.status().last_error.unwrap().code(), "INVALID_CREDENTIALS");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(attempts.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_inflight_attempt() {
        let (client, mut attempts) = client(vec![]);
        client.start();

        attempts.recv().await.unwrap();
        assert_eq!(client.status().state, ClientState::Connecting);

        client.disconnect();
        wait_for_state(&client, ClientState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(attempts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_without_link_fails_fast() {
        let (client, _attempts) = client(vec![]);
        let err = client
            .emit(EventMessage::new("typing", vec![]))
            .unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
        assert!(err.will_retry());
    }
}
