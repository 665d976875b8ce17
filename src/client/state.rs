use serde::Serialize;

use super::ClientError;

/// Connection state of a [`super::RealtimeClient`].
///
/// ```text
/// Disconnected -Start-> Connecting -Established-> Connected
///                           ^   |                     |
///                       Retry   Dropped            Dropped
///                           |   v                     |
///                        Reconnecting <---------------+
/// ```
///
/// `Stop` returns to `Disconnected` from anywhere; `Fatal` does so after an
/// attempt or a live session fails in a way that must not be retried. Pausing is tracked beside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput {
    Start,
    Established,
    Dropped,
    Retry,
    Fatal,
    Stop,
}

/// Transition table. `None` means the input does not apply in that state.
pub fn transition(state: ClientState, input: ClientInput) -> Option<ClientState> {
    use ClientInput::*;
    use ClientState::*;

    match (state, input) {
        (Disconnected, Start) => Some(Connecting),
        (Connecting, Established) => Some(Connected),
        (Connecting | Connected, Dropped) => Some(Reconnecting),
        (Reconnecting, Retry) => Some(Connecting),
        (Connecting | Connected | Reconnecting, Fatal) => Some(Disconnected),
        (Connecting | Connected | Reconnecting, Stop) => Some(Disconnected),
        _ => None,
    }
}

/// Snapshot published on the client's status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ClientState,
    /// Attempts are suppressed until resumed
    pub paused: bool,
    pub last_error: Option<ClientError>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: ClientState::Disconnected,
            paused: false,
            last_error: None,
        }
    }
}
