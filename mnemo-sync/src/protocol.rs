//! Wire formats for both sync channels.
//!
//! The operation channel carries raw CRDT bytes in binary websocket frames:
//! the first client frame after open is a full snapshot, everything after is
//! an incremental update. The key-value channel carries JSON text frames:
//!
//! ```text
//! {"key": "spaces/abc/notes.json", "value": <any JSON>, "updatedAt": 1700000000000}
//! ```
//!
//! A frame without `updatedAt` is treated as timestamp 0.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// The two logical sync channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Binary CRDT snapshot/update exchange.
    Ops,
    /// JSON last-writer-wins records.
    Kv,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Ops => f.write_str("ops"),
            Channel::Kv => f.write_str("kv"),
        }
    }
}

/// One last-writer-wins record on the key-value channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvFrame {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: u64,
}

impl KvFrame {
    pub fn new(key: impl Into<String>, value: Value, updated_at: u64) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::Text(self.encode()?))
    }
}

/// A payload frame as seen by the sync layers, independent of websocket
/// control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Extract the payload of a websocket message. Control frames yield `None`.
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Frame::Text(text.to_string())),
            Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
            _ => None,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire-level errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The server refused the upgrade for this token. Retrying with the
    /// same credentials cannot succeed.
    #[error("upgrade rejected with status {0}")]
    Unauthorized(u16),
}

impl ProtocolError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ProtocolError::Unauthorized(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::http::StatusCode;
        match &err {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                ProtocolError::Unauthorized(response.status().as_u16())
            }
            _ => ProtocolError::WebSocket(err.to_string()),
        }
    }
}
