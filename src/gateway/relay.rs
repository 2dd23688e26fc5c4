use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::{payload, Gateway, GatewayEventType};
use crate::scheduler::TaskUpdate;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BATCH: usize = 50;

/// Forwards scheduler status updates to READY clients as `task.status`
/// events with payload `{updates: [...]}`.
pub struct TaskStatusRelay;

impl TaskStatusRelay {
    /// Spawn the relay loop.
    ///
    /// - Terminal updates flush the pending batch and then go out on their
    ///   own, so ordering is preserved.
    /// - Everything else is buffered and flushed every 100ms or once the
    ///   buffer reaches 50 updates.
    ///
    /// The loop exits when `shutdown` fires or the scheduler drops its
    /// sender, flushing whatever is buffered.
    pub fn start(
        mut rx: broadcast::Receiver<TaskUpdate>,
        gateway: Gateway,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer: Vec<TaskUpdate> = Vec::with_capacity(DEFAULT_MAX_BATCH);
            let mut interval = time::interval(DEFAULT_FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    result = rx.recv() => {
                        match result {
                            Ok(update) => {
                                if update.status.is_terminal() {
                                    flush(&gateway, &mut buffer).await;
                                    buffer.push(update);
                                    flush(&gateway, &mut buffer).await;
                                } else {
                                    buffer.push(update);
                                    if buffer.len() >= DEFAULT_MAX_BATCH {
                                        flush(&gateway, &mut buffer).await;
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("task status relay lagged, dropped {n} updates");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                flush(&gateway, &mut buffer).await;
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        flush(&gateway, &mut buffer).await;
                    }
                    _ = shutdown.cancelled() => {
                        flush(&gateway, &mut buffer).await;
                        break;
                    }
                }
            }
        })
    }
}

async fn flush(gateway: &Gateway, buffer: &mut Vec<TaskUpdate>) {
    if buffer.is_empty() {
        return;
    }
    match serde_json::to_value(&*buffer) {
        Ok(updates) => {
            gateway
                .broadcast(
                    GatewayEventType::TaskStatus,
                    payload(json!({ "updates": updates })),
                    &[],
                    None,
                )
                .await;
        }
        Err(e) => tracing::warn!("failed to encode task status batch: {e}"),
    }
    buffer.clear();
}
