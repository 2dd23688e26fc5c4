//! Real-time multi-client gateway.
//!
//! The gateway owns every client connection and provides:
//! - A HELLO / IDENTIFY / READY handshake with presence tracking
//! - Globally sequenced `send` and `broadcast`
//! - A bounded history for client-driven gap recovery (`get_events_since`)
//! - Heartbeat supervision that drops silent peers
//!
//! Client table, sequence counter and history live behind one async mutex.
//! Sequence numbers are assigned and delivered under that lock, so every
//! client sees them strictly increasing.
//!
//! # Sub-modules
//!
//! - `event`: wire message and event type catalogue
//! - `client`: connection records and the `Transport` seam
//! - `history`: bounded broadcast ring
//! - `relay`: forwards scheduler status updates as `task.status` events

mod client;
mod event;
mod history;
pub mod relay;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::HandlerError;

use client::GatewayClient;
pub use client::{
    ChannelTransport, ClientInfo, ConnectionState, PresenceEntry, Transport, TransportError,
};
pub use event::{
    payload, EventPayload, GatewayEvent, GatewayEventType, ERROR_INVALID_EVENT,
    ERROR_INVALID_JSON,
};
use history::EventHistory;

pub type GatewayReply = Result<Option<GatewayEvent>, HandlerError>;

/// Handler for a non-built-in inbound event type. The first handler that
/// returns `Some` supplies the reply.
#[async_trait]
pub trait GatewayHandler: Send + Sync {
    async fn handle(&self, client: ClientInfo, event: GatewayEvent) -> GatewayReply;
}

#[async_trait]
impl<F, Fut> GatewayHandler for F
where
    F: Fn(ClientInfo, GatewayEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayReply> + Send + 'static,
{
    async fn handle(&self, client: ClientInfo, event: GatewayEvent) -> GatewayReply {
        (self)(client, event).await
    }
}

struct GatewayState {
    clients: HashMap<String, GatewayClient>,
    sequence: u64,
    history: EventHistory,
    connections: u64,
}

impl GatewayState {
    fn next_seq(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

struct Monitor {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct GatewayInner {
    config: GatewayConfig,
    state: Mutex<GatewayState>,
    handlers: DashMap<GatewayEventType, Vec<Arc<dyn GatewayHandler>>>,
    monitor: StdMutex<Option<Monitor>>,
}

/// Cheap to clone; clones share the same client table.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let history = EventHistory::new(config.history_capacity);
        Self {
            inner: Arc::new(GatewayInner {
                config,
                state: Mutex::new(GatewayState {
                    clients: HashMap::new(),
                    sequence: 0,
                    history,
                    connections: 0,
                }),
                handlers: DashMap::new(),
                monitor: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// A channel transport sized by `outbound_buffer`, for a connection
    /// about to be passed to `connect` or `serve`.
    pub fn channel_transport(&self) -> (ChannelTransport, tokio::sync::mpsc::Receiver<String>) {
        ChannelTransport::new(self.inner.config.outbound_buffer)
    }

    // -- connection lifecycle ------------------------------------------------

    /// Register a new connection and greet it with HELLO.
    ///
    /// A reconnect under an existing id replaces the old record.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        client_id: Option<String>,
    ) -> ClientInfo {
        self.open(transport, client_id).await.0
    }

    /// Like `connect`, also returning the number identifying this
    /// particular registration of the client id.
    async fn open(
        &self,
        transport: Arc<dyn Transport>,
        client_id: Option<String>,
    ) -> (ClientInfo, u64) {
        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let hello = GatewayEvent::new(
            GatewayEventType::Hello,
            payload(json!({
                "heartbeat_interval": self.inner.config.heartbeat_interval().as_secs_f64(),
                "client_id": client_id,
            })),
        );

        let mut state = self.inner.state.lock().await;
        state.connections += 1;
        let connection = state.connections;
        let mut client = GatewayClient::new(client_id.clone(), connection, transport);
        client.deliver(&hello).await;
        let info = client.info();
        if state.clients.insert(client_id.clone(), client).is_some() {
            tracing::warn!("client {client_id} reconnected, replacing previous connection");
        }
        drop(state);

        tracing::info!("client connected: {client_id}");
        (info, connection)
    }

    /// Remove a client and tell everyone else it left. Returns false when
    /// the client was not connected.
    pub async fn disconnect(&self, client_id: &str, reason: &str) -> bool {
        self.disconnect_connection(client_id, None, reason).await
    }

    /// Disconnect `client_id`, but only while it is still held by
    /// `connection` when one is given.
    async fn disconnect_connection(
        &self,
        client_id: &str,
        connection: Option<u64>,
        reason: &str,
    ) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let current = state
                .clients
                .get(client_id)
                .is_some_and(|client| connection.map_or(true, |c| c == client.connection));
            if current {
                state.clients.remove(client_id)
            } else {
                None
            }
        };
        let Some(mut client) = removed else {
            return false;
        };
        client.state = ConnectionState::Disconnected;

        self.broadcast(
            GatewayEventType::PresenceLeave,
            payload(json!({
                "client_id": client_id,
                "user_id": client.user_id,
                "reason": reason,
            })),
            &[client_id],
            None,
        )
        .await;

        tracing::info!("client disconnected: {client_id} ({reason})");
        true
    }

    /// Drive one connection: connect, feed every inbound frame through
    /// [`Gateway::handle_message`], write replies back, and disconnect with
    /// reason `connection_closed` once `incoming` ends.
    pub async fn serve<S>(
        &self,
        transport: Arc<dyn Transport>,
        incoming: S,
        client_id: Option<String>,
    ) -> String
    where
        S: Stream<Item = String> + Send,
    {
        let (info, connection) = self.open(transport, client_id).await;
        let client_id = info.client_id;
        futures::pin_mut!(incoming);

        while let Some(raw) = incoming.next().await {
            if !self.holds_connection(&client_id, connection).await {
                // Dropped by the heartbeat monitor or replaced by a reconnect.
                tracing::debug!("session for {client_id} ended: connection no longer registered");
                return client_id;
            }
            if let Some(reply) = self.handle_message(&client_id, &raw).await {
                self.reply(&client_id, &reply).await;
            }
        }

        self.disconnect_connection(&client_id, Some(connection), "connection_closed")
            .await;
        client_id
    }

    async fn holds_connection(&self, client_id: &str, connection: u64) -> bool {
        self.inner
            .state
            .lock()
            .await
            .clients
            .get(client_id)
            .is_some_and(|client| client.connection == connection)
    }

    // -- inbound -------------------------------------------------------------

    /// Process one inbound frame. Returns the reply for the sender, if any.
    /// Unknown clients get no reply.
    pub async fn handle_message(&self, client_id: &str, raw: &str) -> Option<GatewayEvent> {
        let mut state = self.inner.state.lock().await;
        let client = state.clients.get_mut(client_id)?;

        let mut event = match GatewayEvent::parse(raw) {
            Ok(event) => event,
            Err(error) => return Some(error),
        };

        if let Some(seq) = event.seq {
            let expected = client.last_seq_received + 1;
            if seq > expected {
                tracing::warn!("gap detected for {client_id}: expected {expected}, got {seq}");
            }
            client.last_seq_received = seq;
        }

        match event.event_type {
            GatewayEventType::Heartbeat => {
                client.touch_heartbeat();
                Some(GatewayEvent::new(
                    GatewayEventType::HeartbeatAck,
                    payload(json!({ "timestamp": unix_seconds() })),
                ))
            }
            GatewayEventType::Identify => {
                client.user_id = event
                    .payload
                    .get("user_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                client.device_type = event
                    .payload
                    .get("device_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                client.metadata = event
                    .payload
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                client.state = ConnectionState::Ready;
                let join = payload(json!({
                    "client_id": client_id,
                    "user_id": client.user_id,
                    "device_type": client.device_type,
                }));
                drop(state);
                Some(self.complete_identify(client_id, join).await)
            }
            _ => {
                let info = client.info();
                drop(state);
                event.client_id.get_or_insert_with(|| client_id.to_string());
                self.dispatch(info, event).await
            }
        }
    }

    async fn complete_identify(&self, client_id: &str, join: EventPayload) -> GatewayEvent {
        self.broadcast(GatewayEventType::PresenceJoin, join, &[client_id], None)
            .await;

        let state = self.inner.state.lock().await;
        let mut presence: Vec<PresenceEntry> = state
            .clients
            .values()
            .filter(|client| client.state == ConnectionState::Ready)
            .map(GatewayClient::presence)
            .collect();
        presence.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        let last_seq = state.sequence;
        drop(state);

        tracing::info!("client identified: {client_id}");
        GatewayEvent::new(
            GatewayEventType::Ready,
            payload(json!({
                "client_id": client_id,
                "presence": presence,
                "last_seq": last_seq,
            })),
        )
    }

    async fn dispatch(&self, client: ClientInfo, event: GatewayEvent) -> Option<GatewayEvent> {
        let handlers: Vec<Arc<dyn GatewayHandler>> = self
            .inner
            .handlers
            .get(&event.event_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(client.clone(), event.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(reply))) => return Some(reply),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::error!("gateway handler error on {}: {e}", event.event_type);
                }
                Err(_) => {
                    tracing::error!("gateway handler panicked on {}", event.event_type);
                }
            }
        }
        None
    }

    /// Register a handler for an inbound event type. Handlers for the
    /// built-in `heartbeat` and `identify` types are never invoked.
    pub fn on_event<H>(&self, event_type: GatewayEventType, handler: H)
    where
        H: GatewayHandler + 'static,
    {
        self.inner
            .handlers
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
        tracing::debug!("registered gateway handler for {event_type}");
    }

    // -- outbound ------------------------------------------------------------

    /// Deliver a sequenced event to one client. False if the client is
    /// unknown or delivery failed.
    pub async fn send(
        &self,
        client_id: &str,
        event_type: GatewayEventType,
        payload: EventPayload,
    ) -> bool {
        let mut state = self.inner.state.lock().await;
        if !state.clients.contains_key(client_id) {
            return false;
        }
        let seq = state.next_seq();
        let event = GatewayEvent::new(event_type, payload).with_seq(seq);
        match state.clients.get_mut(client_id) {
            Some(client) => client.deliver(&event).await,
            None => false,
        }
    }

    /// Write an unsequenced reply (as returned by `handle_message`) to one
    /// client.
    pub async fn reply(&self, client_id: &str, event: &GatewayEvent) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.clients.get_mut(client_id) {
            Some(client) => client.deliver(event).await,
            None => false,
        }
    }

    /// Sequence, record and deliver one event to every READY client that is
    /// not in `exclude` and, when `only` is a non-empty list, is listed in
    /// it. An empty `only` list does not filter. Returns the number of
    /// successful deliveries.
    pub async fn broadcast(
        &self,
        event_type: GatewayEventType,
        payload: EventPayload,
        exclude: &[&str],
        only: Option<&[&str]>,
    ) -> usize {
        let only = only.filter(|only| !only.is_empty());
        self.broadcast_where(event_type, payload, |client| {
            !exclude.contains(&client.client_id.as_str())
                && only.map_or(true, |only| only.contains(&client.client_id.as_str()))
        })
        .await
    }

    /// Broadcast to READY clients subscribed to the event type's domain
    /// (`chat` for `chat.message`).
    pub async fn broadcast_topic(
        &self,
        event_type: GatewayEventType,
        payload: EventPayload,
    ) -> usize {
        let topic = event_type.domain();
        self.broadcast_where(event_type, payload, |client| {
            client.subscriptions.contains(topic)
        })
        .await
    }

    async fn broadcast_where<F>(
        &self,
        event_type: GatewayEventType,
        payload: EventPayload,
        include: F,
    ) -> usize
    where
        F: Fn(&GatewayClient) -> bool,
    {
        let mut state = self.inner.state.lock().await;
        let seq = state.next_seq();
        let event = GatewayEvent::new(event_type, payload).with_seq(seq);
        state.history.push(event.clone());

        let mut delivered = 0;
        for client in state.clients.values_mut() {
            if client.state != ConnectionState::Ready || !include(client) {
                continue;
            }
            if client.deliver(&event).await {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.clients.get_mut(client_id) {
            Some(client) => {
                client.subscriptions.insert(topic.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        state
            .clients
            .get_mut(client_id)
            .is_some_and(|client| client.subscriptions.remove(topic))
    }

    // -- introspection -------------------------------------------------------

    /// Broadcast events with a sequence number greater than `seq`, oldest
    /// first. Only as far back as the history capacity.
    pub async fn get_events_since(&self, seq: u64) -> Vec<GatewayEvent> {
        self.inner.state.lock().await.history.since(seq)
    }

    pub async fn get_presence(&self) -> Vec<PresenceEntry> {
        let state = self.inner.state.lock().await;
        let mut presence: Vec<PresenceEntry> =
            state.clients.values().map(GatewayClient::presence).collect();
        presence.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        presence
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let state = self.inner.state.lock().await;
        let mut clients: Vec<ClientInfo> =
            state.clients.values().map(GatewayClient::info).collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    pub async fn get_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner
            .state
            .lock()
            .await
            .clients
            .get(client_id)
            .map(GatewayClient::info)
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.inner.state.lock().await.clients.contains_key(client_id)
    }

    pub async fn client_count(&self) -> usize {
        self.inner.state.lock().await.clients.len()
    }

    /// Latest sequence number assigned.
    pub async fn last_seq(&self) -> u64 {
        self.inner.state.lock().await.sequence
    }

    // -- heartbeat supervision -----------------------------------------------

    /// Disconnect every client silent for longer than the heartbeat timeout.
    /// Returns the ids that were dropped.
    pub async fn reap_stale_clients(&self) -> Vec<String> {
        let timeout = self.inner.config.heartbeat_timeout();
        let stale: Vec<(String, u64)> = {
            let state = self.inner.state.lock().await;
            state
                .clients
                .values()
                .filter(|client| client.last_heartbeat_at.elapsed() > timeout)
                .map(|client| (client.client_id.clone(), client.connection))
                .collect()
        };

        let mut dropped = Vec::with_capacity(stale.len());
        for (client_id, connection) in stale {
            tracing::warn!("client {client_id} heartbeat timeout");
            if self
                .disconnect_connection(&client_id, Some(connection), "heartbeat_timeout")
                .await
            {
                dropped.push(client_id);
            }
        }
        dropped
    }

    /// Spawn the heartbeat monitor. No-op when already running.
    pub fn start_heartbeat_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().expect("gateway monitor mutex poisoned");
        if monitor.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let gateway = self.clone();
        let token = shutdown.clone();
        let interval = self.inner.config.heartbeat_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }
                gateway.reap_stale_clients().await;
            }
        });
        *monitor = Some(Monitor { shutdown, handle });
        tracing::info!("heartbeat monitor started");
    }

    /// Stop the heartbeat monitor and wait for it to exit. No-op when not
    /// running.
    pub async fn stop_heartbeat_monitor(&self) {
        let monitor = self
            .inner
            .monitor
            .lock()
            .expect("gateway monitor mutex poisoned")
            .take();
        let Some(monitor) = monitor else {
            return;
        };
        monitor.shutdown.cancel();
        if let Err(e) = monitor.handle.await {
            tracing::warn!("heartbeat monitor exited abnormally: {e}");
        }
        tracing::info!("heartbeat monitor stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .expect("gateway monitor mutex poisoned")
            .is_some()
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.inner.config)
            .field("handler_types", &self.inner.handlers.len())
            .finish()
    }
}

fn unix_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
