//! One explicitly constructed set of orchestration components.

use std::sync::{Arc, Mutex};

use serde_json::{json, Map};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{DispatchResult, EventBus, HookEvent};
use crate::config::CoreConfig;
use crate::gateway::relay::TaskStatusRelay;
use crate::gateway::{Gateway, GatewayEventType};
use crate::routing::{HookRoute, TaskRoute};
use crate::scheduler::TaskScheduler;

struct RelayHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the event bus, scheduler and gateway and wires them together.
/// Collaborators receive clones of the parts they need.
pub struct AppContext {
    config: CoreConfig,
    bus: Arc<EventBus>,
    scheduler: TaskScheduler,
    gateway: Gateway,
    relay: Mutex<Option<RelayHandle>>,
}

impl AppContext {
    pub fn new(config: CoreConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let scheduler = TaskScheduler::new(config.scheduler.clone());
        let gateway = Gateway::new(config.gateway.clone());
        Self {
            config,
            bus,
            scheduler,
            gateway,
            relay: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Inbound `event_type` messages trigger `hook`.
    pub fn route_to_hook(&self, event_type: GatewayEventType, hook: HookEvent) {
        self.gateway
            .on_event(event_type, HookRoute::new(self.bus.clone(), hook));
    }

    /// Inbound `event_type` messages submit the registered task `task`.
    pub fn route_to_task(&self, event_type: GatewayEventType, task: impl Into<String>) {
        self.gateway
            .on_event(event_type, TaskRoute::new(self.scheduler.clone(), task));
    }

    /// Start the worker pool, heartbeat monitor and task status relay, then
    /// trigger the `startup` hook.
    pub async fn start(&self) -> DispatchResult {
        self.scheduler.start();
        self.gateway.start_heartbeat_monitor();
        {
            let mut relay = self.relay.lock().expect("relay mutex poisoned");
            if relay.is_none() {
                let shutdown = CancellationToken::new();
                let handle = TaskStatusRelay::start(
                    self.scheduler.subscribe(),
                    self.gateway.clone(),
                    shutdown.clone(),
                );
                *relay = Some(RelayHandle { shutdown, handle });
            }
        }

        tracing::info!("orchestration core started");
        self.bus
            .trigger(
                HookEvent::Startup,
                payload_with("workers", json!(self.scheduler.max_workers())),
            )
            .await
    }

    /// Trigger the `shutdown` hook, then stop the monitor, relay and
    /// scheduler. `wait` is forwarded to [`TaskScheduler::stop`].
    pub async fn shutdown(&self, wait: bool) -> DispatchResult {
        let result = self
            .bus
            .trigger(HookEvent::Shutdown, payload_with("wait", json!(wait)))
            .await;

        self.gateway.stop_heartbeat_monitor().await;
        self.scheduler.stop(wait).await;

        let relay = self.relay.lock().expect("relay mutex poisoned").take();
        if let Some(relay) = relay {
            relay.shutdown.cancel();
            if let Err(e) = relay.handle.await {
                tracing::warn!("task status relay exited abnormally: {e}");
            }
        }

        tracing::info!("orchestration core stopped");
        result
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

fn payload_with(key: &str, value: serde_json::Value) -> Map<String, serde_json::Value> {
    let mut payload = Map::new();
    payload.insert(key.to_string(), value);
    payload
}
