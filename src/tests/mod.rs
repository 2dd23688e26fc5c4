//! Cross-module scenario tests and shared helpers.
//!
//! Component unit tests live next to their code; these exercise the
//! ordering, retry, concurrency and protocol guarantees end to end.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, SchedulerConfig};
use crate::gateway::{Gateway, GatewayEvent};
use crate::scheduler::TaskScheduler;



#[cfg(test)]
mod scheduling;

pub fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn scheduler_with_workers(workers: usize) -> TaskScheduler {
    TaskScheduler::new(SchedulerConfig {
        max_workers: workers,
        ..SchedulerConfig::default()
    })
}

pub fn gateway_with_history(capacity: usize) -> Gateway {
    Gateway::new(GatewayConfig {
        history_capacity: capacity,
        ..GatewayConfig::default()
    })
}

/// A connected client whose outbound frames can be inspected.
pub struct TestClient {
    pub id: String,
    rx: mpsc::Receiver<String>,
}

impl TestClient {
    pub async fn connect(gateway: &Gateway, id: &str) -> Self {
        let (transport, rx) = gateway.channel_transport();
        gateway
            .connect(Arc::new(transport), Some(id.to_string()))
            .await;
        Self {
            id: id.to_string(),
            rx,
        }
    }

    /// Connect, identify and discard everything received so far.
    pub async fn ready(gateway: &Gateway, id: &str) -> Self {
        let mut client = Self::connect(gateway, id).await;
        gateway
            .handle_message(id, r#"{"type":"identify"}"#)
            .await
            .expect("identify reply");
        client.drain();
        client
    }

    pub fn drain(&mut self) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(raw) = self.rx.try_recv() {
            events.push(serde_json::from_str(&raw).expect("valid wire event"));
        }
        events
    }
}
