use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::event::GatewayEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    /// Reserved.
    Connected,
    /// Reserved.
    Identifying,
    Ready,
    /// Reserved.
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("outbound buffer full")]
    Full,
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Outbound half of a client connection.
///
/// The gateway borrows a transport for the lifetime of the connection and
/// drops its handle on disconnect. Implementations must not block for long:
/// sends happen while the gateway's client table is locked.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
}

/// Transport backed by a bounded channel. The receiving half is drained by
/// whatever owns the real socket.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

// ---------------------------------------------------------------------------
// Client records
// ---------------------------------------------------------------------------

pub(crate) struct GatewayClient {
    pub(crate) client_id: String,
    /// Distinguishes successive connections registered under one id.
    pub(crate) connection: u64,
    transport: Arc<dyn Transport>,
    pub(crate) state: ConnectionState,
    pub(crate) user_id: Option<String>,
    pub(crate) device_type: String,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) last_heartbeat: DateTime<Utc>,
    /// Monotonic twin of `last_heartbeat` used by the timeout check.
    pub(crate) last_heartbeat_at: Instant,
    pub(crate) subscriptions: HashSet<String>,
    pub(crate) metadata: Map<String, Value>,
    pub(crate) last_seq_sent: u64,
    pub(crate) last_seq_received: u64,
}

impl GatewayClient {
    pub(crate) fn new(client_id: String, connection: u64, transport: Arc<dyn Transport>) -> Self {
        Self {
            client_id,
            connection,
            transport,
            state: ConnectionState::Connecting,
            user_id: None,
            device_type: "unknown".to_string(),
            connected_at: Utc::now(),
            last_heartbeat: Utc::now(),
            last_heartbeat_at: Instant::now(),
            subscriptions: HashSet::new(),
            metadata: Map::new(),
            last_seq_sent: 0,
            last_seq_received: 0,
        }
    }

    pub(crate) fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
        self.last_heartbeat_at = Instant::now();
    }

    /// Write one event to the transport. Returns false on any failure.
    pub(crate) async fn deliver(&mut self, event: &GatewayEvent) -> bool {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("failed to encode event for {}: {e}", self.client_id);
                return false;
            }
        };
        match self.transport.send_text(text).await {
            Ok(()) => {
                if let Some(seq) = event.seq {
                    self.last_seq_sent = seq;
                }
                true
            }
            Err(e) => {
                tracing::error!("failed to send to {}: {e}", self.client_id);
                false
            }
        }
    }

    pub(crate) fn info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.client_id.clone(),
            state: self.state,
            user_id: self.user_id.clone(),
            device_type: self.device_type.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            subscriptions: self.subscriptions.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            last_seq_sent: self.last_seq_sent,
            last_seq_received: self.last_seq_received,
        }
    }

    pub(crate) fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            device_type: self.device_type.clone(),
            state: self.state,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Snapshot of one connection, handed to gateway handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub device_type: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub subscriptions: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    pub last_seq_sent: u64,
    pub last_seq_received: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub client_id: String,
    pub user_id: Option<String>,
    pub device_type: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
