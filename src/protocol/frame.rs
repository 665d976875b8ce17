use serde::{Deserialize, Serialize};

use super::{Packet, ProtocolError};

/// Handshake data sent in the server's OPEN frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

/// Outer transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenPayload),
    Close,
    Ping,
    Pong,
    Message(Packet),
}

impl Frame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Open(_) => "open",
            Frame::Close => "close",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Message(_) => "message",
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Open(payload) => {
                let body = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
                format!("0{}", body)
            }
            Frame::Close => "1".to_string(),
            Frame::Ping => "2".to_string(),
            Frame::Pong => "3".to_string(),
            Frame::Message(packet) => format!("4{}", packet.encode()),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ProtocolError::EmptyFrame)?;
        let body = chars.as_str();

        match kind {
            '0' => Ok(Frame::Open(serde_json::from_str(body)?)),
            '1' => Ok(Frame::Close),
            '2' => Ok(Frame::Ping),
            '3' => Ok(Frame::Pong),
            '4' => Ok(Frame::Message(Packet::decode(body)?)),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    /// Decode after checking the frame against a size limit.
    pub fn decode_bounded(text: &str, max_bytes: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                limit: max_bytes,
            });
        }
        Self::decode(text)
    }
}
