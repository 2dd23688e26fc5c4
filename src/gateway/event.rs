use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Inbound text was not valid JSON.
pub const ERROR_INVALID_JSON: u16 = 4001;
/// Inbound JSON did not match the event schema.
pub const ERROR_INVALID_EVENT: u16 = 4002;

pub type EventPayload = Map<String, Value>;

/// Closed set of wire event types. Application types are dotted
/// `domain.action` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayEventType {
    // Connection control
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck,
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "reconnect")]
    Reconnect,
    #[serde(rename = "disconnect")]
    Disconnect,

    // Application
    #[serde(rename = "chat.message")]
    ChatMessage,
    #[serde(rename = "chat.stream_start")]
    ChatStreamStart,
    #[serde(rename = "chat.stream_chunk")]
    ChatStreamChunk,
    #[serde(rename = "chat.stream_end")]
    ChatStreamEnd,
    #[serde(rename = "recording.start")]
    RecordingStart,
    #[serde(rename = "recording.stop")]
    RecordingStop,
    #[serde(rename = "recording.event")]
    RecordingEvent,
    #[serde(rename = "memory.store")]
    MemoryStore,
    #[serde(rename = "memory.retrieve")]
    MemoryRetrieve,
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    #[serde(rename = "presence.join")]
    PresenceJoin,
    #[serde(rename = "presence.leave")]
    PresenceLeave,
    #[serde(rename = "task.status")]
    TaskStatus,

    #[serde(rename = "error")]
    Error,
    #[serde(rename = "system")]
    System,
}

impl GatewayEventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Identify => "identify",
            Self::Ready => "ready",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
            Self::ChatMessage => "chat.message",
            Self::ChatStreamStart => "chat.stream_start",
            Self::ChatStreamChunk => "chat.stream_chunk",
            Self::ChatStreamEnd => "chat.stream_end",
            Self::RecordingStart => "recording.start",
            Self::RecordingStop => "recording.stop",
            Self::RecordingEvent => "recording.event",
            Self::MemoryStore => "memory.store",
            Self::MemoryRetrieve => "memory.retrieve",
            Self::PresenceUpdate => "presence.update",
            Self::PresenceJoin => "presence.join",
            Self::PresenceLeave => "presence.leave",
            Self::TaskStatus => "task.status",
            Self::Error => "error",
            Self::System => "system",
        }
    }

    /// The part before the dot, or the whole name for undotted types.
    pub fn domain(&self) -> &'static str {
        let name = self.as_str();
        name.split_once('.').map_or(name, |(domain, _)| domain)
    }

    /// Reserved protocol control types.
    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Hello
                | Self::Heartbeat
                | Self::HeartbeatAck
                | Self::Identify
                | Self::Ready
                | Self::Reconnect
                | Self::Disconnect
                | Self::Error
        )
    }
}

impl fmt::Display for GatewayEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub event_type: GatewayEventType,
    #[serde(default)]
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl GatewayEvent {
    pub fn new(event_type: GatewayEventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            payload,
            seq: None,
            timestamp: Utc::now(),
            client_id: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// A recoverable ERROR reply. The connection stays open.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new(
            GatewayEventType::Error,
            payload(json!({
                "code": code,
                "message": message.into(),
                "recoverable": true,
            })),
        )
    }

    /// The error code carried by an ERROR event.
    pub fn error_code(&self) -> Option<u16> {
        if self.event_type != GatewayEventType::Error {
            return None;
        }
        self.payload
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one inbound frame, mapping failures to the protocol error
    /// event that should be sent back.
    pub fn parse(raw: &str) -> Result<Self, GatewayEvent> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|_| GatewayEvent::error(ERROR_INVALID_JSON, "Invalid JSON"))?;
        serde_json::from_value(value).map_err(|e| {
            GatewayEvent::error(ERROR_INVALID_EVENT, format!("Invalid event format: {e}"))
        })
    }
}

/// Turn a `json!({...})` literal into a payload; non-objects become empty.
pub fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
