//! Gateway handlers that relay inbound client commands into the hook bus
//! and the task scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::{EventBus, HookEvent};
use crate::gateway::{
    payload, ClientInfo, GatewayEvent, GatewayEventType, GatewayHandler, GatewayReply,
    ERROR_INVALID_EVENT,
};
use crate::scheduler::{SchedulerError, TaskArgs, TaskScheduler};

/// Triggers `event` with the inbound payload plus `client_id`.
///
/// Replies `system` with `{hook, cancelled, handlers_called, errors}`.
pub struct HookRoute {
    bus: Arc<EventBus>,
    event: HookEvent,
}

impl HookRoute {
    pub fn new(bus: Arc<EventBus>, event: HookEvent) -> Self {
        Self { bus, event }
    }
}

#[async_trait]
impl GatewayHandler for HookRoute {
    async fn handle(&self, client: ClientInfo, event: GatewayEvent) -> GatewayReply {
        let mut hook_payload = event.payload;
        hook_payload.insert("client_id".to_string(), Value::String(client.client_id));

        let result = self.bus.trigger(self.event, hook_payload).await;
        let errors: Vec<Value> = result
            .errors
            .iter()
            .map(|failure| json!({"handler": failure.name, "error": failure.error}))
            .collect();

        Ok(Some(GatewayEvent::new(
            GatewayEventType::System,
            payload(json!({
                "hook": self.event.as_str(),
                "cancelled": result.cancelled,
                "handlers_called": result.handlers_called,
                "errors": errors,
            })),
        )))
    }
}

/// Submits `task` with `args` / `kwargs` read from the inbound payload.
///
/// Replies `system` with `{task_id}`, or ERROR 4002 when the task name is
/// not registered.
pub struct TaskRoute {
    scheduler: TaskScheduler,
    task: String,
}

impl TaskRoute {
    pub fn new(scheduler: TaskScheduler, task: impl Into<String>) -> Self {
        Self {
            scheduler,
            task: task.into(),
        }
    }
}

#[async_trait]
impl GatewayHandler for TaskRoute {
    async fn handle(&self, client: ClientInfo, event: GatewayEvent) -> GatewayReply {
        let args = TaskArgs::from_payload(&event.payload);
        match self.scheduler.submit(&self.task, args, None) {
            Ok(task_id) => {
                tracing::debug!("client {} submitted task {task_id}", client.client_id);
                Ok(Some(GatewayEvent::new(
                    GatewayEventType::System,
                    payload(json!({ "task_id": task_id })),
                )))
            }
            Err(e @ SchedulerError::UnknownTask(_)) => {
                Ok(Some(GatewayEvent::error(ERROR_INVALID_EVENT, e.to_string())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HookOutcome, HookPayload, CANCEL_KEY};
    use crate::config::SchedulerConfig;
    use crate::gateway::{ChannelTransport, Gateway};

    async fn cancel_everything(mut payload: HookPayload) -> HookOutcome {
        payload.insert(CANCEL_KEY.to_string(), json!(true));
        Ok(Some(payload))
    }

    async fn identified(gateway: &Gateway, id: &str) {
        let (transport, _rx) = ChannelTransport::new(8);
        gateway
            .connect(Arc::new(transport), Some(id.to_string()))
            .await;
        gateway.handle_message(id, r#"{"type":"identify"}"#).await;
    }

    #[tokio::test]
    async fn test_hook_route_reports_dispatch() {
        let bus = Arc::new(EventBus::new());
        bus.on(HookEvent::PreMemoryStore, cancel_everything).unwrap();

        let gateway = Gateway::default();
        gateway.on_event(
            GatewayEventType::MemoryStore,
            HookRoute::new(bus.clone(), HookEvent::PreMemoryStore),
        );
        identified(&gateway, "c1").await;

        let reply = gateway
            .handle_message("c1", r#"{"type":"memory.store","payload":{"text":"hi"}}"#)
            .await
            .unwrap();
        assert_eq!(reply.event_type, GatewayEventType::System);
        assert_eq!(reply.payload["hook"], "pre_memory_store");
        assert_eq!(reply.payload["cancelled"], true);
        assert_eq!(reply.payload["handlers_called"], 0);
    }

    #[tokio::test]
    async fn test_task_route_submits_and_rejects_unknown() {
        let scheduler = TaskScheduler::new(SchedulerConfig::default());
        scheduler.register(
            "store",
            |_ctx: crate::scheduler::TaskContext, args: TaskArgs| async move {
                Ok::<_, crate::HandlerError>(json!(args.args.len()))
            },
            Default::default(),
        );

        let gateway = Gateway::default();
        gateway.on_event(
            GatewayEventType::MemoryStore,
            TaskRoute::new(scheduler.clone(), "store"),
        );
        gateway.on_event(
            GatewayEventType::MemoryRetrieve,
            TaskRoute::new(scheduler.clone(), "missing"),
        );
        identified(&gateway, "c1").await;

        let reply = gateway
            .handle_message("c1", r#"{"type":"memory.store","payload":{"args":[1,2]}}"#)
            .await
            .unwrap();
        let task_id = reply.payload["task_id"].as_str().unwrap();
        let task = scheduler.get_task(task_id).unwrap();
        assert_eq!(task.args.args.len(), 2);

        let reply = gateway
            .handle_message("c1", r#"{"type":"memory.retrieve"}"#)
            .await
            .unwrap();
        assert_eq!(reply.error_code(), Some(ERROR_INVALID_EVENT));
    }
}
