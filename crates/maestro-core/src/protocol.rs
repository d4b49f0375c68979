//! WebSocket wire protocol.
//!
//! Every frame in either direction is an [`Envelope`]; the `type` string
//! selects the payload shape. Inbound types form the closed [`ClientMessage`]
//! set, outbound ones the [`ServerEvent`] set. Terminal output bytes are
//! base64-encoded inside JSON frames so arbitrary PTY output survives
//! transport byte-for-byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{AgentActivity, AgentSession};

pub const PROTOCOL_VERSION: u8 = 1;

/// Outer message shape shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Unix milliseconds, kept alongside `ts` for client latency math.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            v: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            ts: now,
            kind: kind.into(),
            payload,
            timestamp: now.timestamp_millis(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload for {kind}: {source}")]
    BadPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid envelope: {0}")]
    BadEnvelope(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ChannelRef {
    /// Exact-match subscription key: `"channel"` or `"channel:id"`.
    /// There is no wildcard matching — callers subscribe to every concrete
    /// id they care about.
    pub fn key(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}", self.channel, id),
            None => self.channel.clone(),
        }
    }
}

pub fn channel_key(channel: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("{channel}:{id}"),
        None => channel.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermInput {
    pub id: String,
    /// Base64-encoded bytes to write to the PTY.
    pub data: String,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TermResize {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Client-to-server message set.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Ping,
    Subscribe(ChannelRef),
    Unsubscribe(ChannelRef),
    TermInput(TermInput),
    TermResize(TermResize),
}

impl ClientMessage {
    /// Parse a raw text frame. Unknown types and malformed payloads are
    /// protocol errors answered on that connection only.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let payload = envelope.payload;

        fn typed<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(payload).map_err(|source| ProtocolError::BadPayload {
                kind: kind.to_string(),
                source,
            })
        }

        match envelope.kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "subscribe" => Ok(ClientMessage::Subscribe(typed("subscribe", payload)?)),
            "unsubscribe" => Ok(ClientMessage::Unsubscribe(typed("unsubscribe", payload)?)),
            "term:input" => Ok(ClientMessage::TermInput(typed("term:input", payload)?)),
            "term:resize" => Ok(ClientMessage::TermResize(typed("term:resize", payload)?)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// One coalesced chunk of terminal output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalFrame {
    pub id: String,
    pub seq: u64,
    /// Unix milliseconds at flush time.
    pub ts: i64,
    /// Base64-encoded output bytes.
    pub data: String,
}

/// Server-to-client message set.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected { client_id: Uuid },
    Pong,
    Subscribed(ChannelRef),
    Error { code: String, message: String },
    TermFrame(TerminalFrame),
    TermExit { id: String, code: i32 },
    AgentCreated(AgentSession),
    AgentUpdated(AgentSession),
    AgentEnded(AgentSession),
    AgentActivity(AgentActivity),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Pong => "pong",
            ServerEvent::Subscribed(_) => "subscribed",
            ServerEvent::Error { .. } => "error",
            ServerEvent::TermFrame(_) => "term:frame",
            ServerEvent::TermExit { .. } => "term:exit",
            ServerEvent::AgentCreated(_) => "agent:created",
            ServerEvent::AgentUpdated(_) => "agent:updated",
            ServerEvent::AgentEnded(_) => "agent:ended",
            ServerEvent::AgentActivity(_) => "agent:activity",
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        let payload = match self {
            ServerEvent::Connected { client_id } => {
                serde_json::json!({ "clientId": client_id })
            }
            ServerEvent::Pong => Value::Null,
            ServerEvent::Subscribed(reference) => {
                serde_json::to_value(reference).unwrap_or(Value::Null)
            }
            ServerEvent::Error { code, message } => {
                serde_json::json!({ "code": code, "message": message })
            }
            ServerEvent::TermFrame(frame) => serde_json::to_value(frame).unwrap_or(Value::Null),
            ServerEvent::TermExit { id, code } => {
                serde_json::json!({ "id": id, "code": code })
            }
            ServerEvent::AgentCreated(session)
            | ServerEvent::AgentUpdated(session)
            | ServerEvent::AgentEnded(session) => {
                serde_json::to_value(session).unwrap_or(Value::Null)
            }
            ServerEvent::AgentActivity(activity) => {
                serde_json::to_value(activity).unwrap_or(Value::Null)
            }
        };
        Envelope::new(kind, payload)
    }

    pub fn to_json(self) -> String {
        serde_json::to_string(&self.into_envelope())
            .unwrap_or_else(|_| r#"{"v":1,"type":"error"}"#.to_string())
    }
}
