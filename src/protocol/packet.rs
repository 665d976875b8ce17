use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::handshake::ConnectErrorPayload;
use super::ProtocolError;

/// Namespace a packet belongs to when the wire omits the namespace segment.
pub const ROOT_NAMESPACE: &str = "/";

/// Packet kind digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
}

impl PacketKind {
    pub fn from_digit(c: char) -> Result<Self, ProtocolError> {
        match c {
            '0' => Ok(PacketKind::Connect),
            '1' => Ok(PacketKind::Disconnect),
            '2' => Ok(PacketKind::Event),
            '3' => Ok(PacketKind::Ack),
            '4' => Ok(PacketKind::ConnectError),
            other => Err(ProtocolError::UnknownPacketKind(other)),
        }
    }

    pub fn digit(self) -> char {
        (b'0' + self as u8) as char
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Connect => "CONNECT",
            PacketKind::Disconnect => "DISCONNECT",
            PacketKind::Event => "EVENT",
            PacketKind::Ack => "ACK",
            PacketKind::ConnectError => "CONNECT_ERROR",
        }
    }
}

/// A named event with its argument list.
///
/// On the wire this is the EVENT array `[name, ...args]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventMessage {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Event with a single object argument, the common shape for server events.
    pub fn with_payload(name: impl Into<String>, payload: Value) -> Self {
        Self::new(name, vec![payload])
    }

    /// First argument, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.args.first()
    }
}

/// A decoded MESSAGE body.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect {
        namespace: String,
        payload: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        event: EventMessage,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        error: ConnectErrorPayload,
    },
}

impl Packet {
    pub fn event(namespace: &str, event: EventMessage) -> Self {
        Packet::Event {
            namespace: namespace.to_string(),
            ack_id: None,
            event,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Connect { .. } => PacketKind::Connect,
            Packet::Disconnect { .. } => PacketKind::Disconnect,
            Packet::Event { .. } => PacketKind::Event,
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::ConnectError { .. } => PacketKind::ConnectError,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Packet::Connect { namespace, .. }
            | Packet::Disconnect { namespace }
            | Packet::Event { namespace, .. }
            | Packet::Ack { namespace, .. }
            | Packet::ConnectError { namespace, .. } => namespace,
        }
    }

    /// Encode into a MESSAGE body.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(32);
        out.push(self.kind().digit());

        let namespace = self.namespace();
        if namespace != ROOT_NAMESPACE && !namespace.is_empty() {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            Packet::Connect { payload, .. } => {
                if let Some(payload) = payload {
                    out.push_str(&payload.to_string());
                }
            }
            Packet::Disconnect { .. } => {}
            Packet::Event { ack_id, event, .. } => {
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut array = Vec::with_capacity(event.args.len() + 1);
                array.push(Value::String(event.name.clone()));
                array.extend(event.args.iter().cloned());
                out.push_str(&Value::Array(array).to_string());
            }
            Packet::Ack { ack_id, args, .. } => {
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            Packet::ConnectError { error, .. } => {
                out.push_str(&serde_json::json!(error).to_string());
            }
        }

        out
    }

    /// Decode a MESSAGE body.
    pub fn decode(body: &str) -> Result<Self, ProtocolError> {
        let mut chars = body.chars();
        let kind = PacketKind::from_digit(chars.next().ok_or(ProtocolError::EmptyFrame)?)?;
        let rest = chars.as_str();

        let (namespace, rest) = split_namespace(rest);
        let (ack_id, rest) = split_ack_id(rest)?;
        let payload = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest)?)
        };

        match kind {
            PacketKind::Connect => {
                reject_ack_id(ack_id, kind)?;
                match payload {
                    None | Some(Value::Object(_)) => Ok(Packet::Connect { namespace, payload }),
                    Some(_) => Err(invalid(kind, "payload must be an object")),
                }
            }
            PacketKind::Disconnect => {
                reject_ack_id(ack_id, kind)?;
                if payload.is_some() {
                    return Err(invalid(kind, "payload not allowed"));
                }
                Ok(Packet::Disconnect { namespace })
            }
            PacketKind::Event => {
                let event = match payload {
                    Some(Value::Array(items)) => event_from_array(items)?,
                    Some(_) => return Err(invalid(kind, "payload must be an array")),
                    None => return Err(invalid(kind, "missing payload")),
                };
                Ok(Packet::Event {
                    namespace,
                    ack_id,
                    event,
                })
            }
            PacketKind::Ack => {
                let ack_id = ack_id.ok_or(ProtocolError::MissingAckId)?;
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    None => Vec::new(),
                    Some(_) => return Err(invalid(kind, "payload must be an array")),
                };
                Ok(Packet::Ack {
                    namespace,
                    ack_id,
                    args,
                })
            }
            PacketKind::ConnectError => {
                reject_ack_id(ack_id, kind)?;
                let value = payload.ok_or_else(|| invalid(kind, "missing payload"))?;
                let error: ConnectErrorPayload = serde_json::from_value(value)
                    .map_err(|e| invalid(kind, &e.to_string()))?;
                Ok(Packet::ConnectError { namespace, error })
            }
        }
    }
}

/// Namespace runs from a leading `/` to the first comma; no comma means the
/// whole remainder is the namespace.
fn split_namespace(rest: &str) -> (String, &str) {
    if !rest.starts_with('/') {
        return (ROOT_NAMESPACE.to_string(), rest);
    }
    match rest.find(',') {
        Some(idx) => (rest[..idx].to_string(), &rest[idx + 1..]),
        None => (rest.to_string(), ""),
    }
}

/// Greedy leading digit run, read before any JSON decoding.
fn split_ack_id(rest: &str) -> Result<(Option<u64>, &str), ProtocolError> {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Ok((None, rest));
    }
    let raw = &rest[..digits];
    let id = raw
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidAckId(raw.to_string()))?;
    Ok((Some(id), &rest[digits..]))
}

fn reject_ack_id(ack_id: Option<u64>, kind: PacketKind) -> Result<(), ProtocolError> {
    match ack_id {
        Some(_) => Err(ProtocolError::UnexpectedAckId(kind.as_str())),
        None => Ok(()),
    }
}

fn event_from_array(mut items: Vec<Value>) -> Result<EventMessage, ProtocolError> {
    if items.is_empty() {
        return Err(invalid(PacketKind::Event, "empty event array"));
    }
    let name = match items.remove(0) {
        Value::String(name) if !name.is_empty() => name,
        _ => return Err(invalid(PacketKind::Event, "event name must be a non-empty string")),
    };
    Ok(EventMessage { name, args: items })
}

fn invalid(kind: PacketKind, reason: &str) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        reason: reason.to_string(),
    }
}
