//! Background task scheduler.
//!
//! The scheduler is the sole owner of task lifecycle after submission:
//! - Named task definitions are registered once and submitted by name
//! - A fixed pool of workers drains a shared priority queue
//! - Failed attempts are retried up to `max_retries`; timeouts are not
//! - Every status transition is published for observers (see `subscribe`)
//!
//! # State machine
//!
//! `Pending → Queued → Running → {Completed, Failed, Cancelled}`, plus a
//! retry edge back to `Queued` while retries remain.
//!
//! # Sub-modules
//!
//! - `task`: task records, handler contract, results
//! - `queue`: max-priority queue with submission-order tie break

mod queue;
mod task;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::HandlerError;

use queue::TaskQueue;
use task::Task;
pub use task::{
    TaskArgs, TaskContext, TaskDefinition, TaskErrorKind, TaskHandler, TaskOptions, TaskPriority,
    TaskProgress, TaskResult, TaskSnapshot, TaskStatus, TaskUpdate, DEFAULT_MAX_RETRIES,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("unknown task id: {0}")]
    UnknownTaskId(String),
    #[error("task {task_id} did not complete within {timeout:?}")]
    TimedOut { task_id: String, timeout: Duration },
}

/// Counters reported by [`TaskScheduler::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_tasks: usize,
    pub queued: usize,
    pub running: usize,
    pub workers: usize,
    pub by_status: BTreeMap<String, usize>,
}

struct SchedulerState {
    definitions: HashMap<String, TaskDefinition>,
    tasks: HashMap<String, Task>,
    queue: TaskQueue,
    /// Tasks whose handler is currently executing, including ones flagged
    /// cancelled that have not stopped yet.
    running: HashMap<String, AbortHandle>,
    next_order: u64,
}

struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    work_available: Notify,
    task_finished: Notify,
    updates: broadcast::Sender<TaskUpdate>,
    pool: Mutex<Option<WorkerPool>>,
}

/// A claimed task, ready to run outside the state lock.
struct Job {
    task_id: String,
    handle: JoinHandle<Result<Value, HandlerError>>,
    timeout: Option<Duration>,
}

enum Attempt {
    Finished(Result<Result<Value, HandlerError>, JoinError>),
    TimedOut(Duration),
}

/// Priority task scheduler with a bounded worker pool.
///
/// Cheap to clone; all clones share one queue and one worker pool.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state: Mutex::new(SchedulerState {
                    definitions: HashMap::new(),
                    tasks: HashMap::new(),
                    queue: TaskQueue::new(),
                    running: HashMap::new(),
                    next_order: 0,
                }),
                work_available: Notify::new(),
                task_finished: Notify::new(),
                updates,
                pool: Mutex::new(None),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    /// Store a reusable task definition. Re-registering a name replaces it.
    pub fn register<H>(&self, name: impl Into<String>, handler: H, options: TaskOptions)
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        let mut state = self.inner.lock_state();
        state.definitions.insert(
            name.clone(),
            TaskDefinition {
                name: name.clone(),
                handler: Arc::new(handler),
                options,
            },
        );
        tracing::debug!("registered task: {name}");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.lock_state().definitions.contains_key(name)
    }

    /// Queue a registered task. `priority` overrides the definition default.
    pub fn submit(
        &self,
        name: &str,
        args: TaskArgs,
        priority: Option<TaskPriority>,
    ) -> Result<String, SchedulerError> {
        let task_id = {
            let mut state = self.inner.lock_state();
            let Some(definition) = state.definitions.get(name) else {
                return Err(SchedulerError::UnknownTask(name.to_string()));
            };
            let handler = definition.handler.clone();
            let mut options = definition.options;
            if let Some(priority) = priority {
                options.priority = priority;
            }
            self.inner
                .enqueue_new(&mut state, name.to_string(), handler, args, options)
        };
        tracing::info!("task submitted: {task_id} ({name})");
        Ok(task_id)
    }

    /// Queue ad-hoc work that bypasses the registry.
    pub fn submit_raw<H>(
        &self,
        name: impl Into<String>,
        handler: H,
        args: TaskArgs,
        options: TaskOptions,
    ) -> String
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        let task_id = {
            let mut state = self.inner.lock_state();
            self.inner
                .enqueue_new(&mut state, name.clone(), Arc::new(handler), args, options)
        };
        tracing::info!("raw task submitted: {task_id} ({name})");
        task_id
    }

    /// Cancel a task.
    ///
    /// Pending and queued tasks are cancelled immediately. A running task is
    /// flagged cancelled and its context token fires, but the handler keeps
    /// running until it honours the token or hits its timeout. Returns
    /// `false` for unknown or already finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let update = {
            let mut state = self.inner.lock_state();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            match task.status {
                TaskStatus::Pending | TaskStatus::Queued => {
                    task.status = TaskStatus::Cancelled;
                    task.error_kind = Some(TaskErrorKind::Cancelled);
                    task.completed_at = Some(Utc::now());
                    task.shared.cancel.cancel();
                    let update = TaskUpdate::from_task(task);
                    state.queue.remove(task_id);
                    tracing::info!("task cancelled: {task_id}");
                    update
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    task.error_kind = Some(TaskErrorKind::Cancelled);
                    task.completed_at = Some(Utc::now());
                    task.shared.cancel.cancel();
                    tracing::info!("task marked for cancellation: {task_id}");
                    TaskUpdate::from_task(task)
                }
                _ => return false,
            }
        };
        self.inner.publish(update);
        self.inner.task_finished.notify_waiters();
        true
    }

    pub fn get_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.lock_state().tasks.get(task_id).map(|task| task.status)
    }

    pub fn get_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner
            .lock_state()
            .tasks
            .get(task_id)
            .map(|task| task.shared.progress())
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.inner.lock_state().tasks.get(task_id).map(Task::snapshot)
    }

    /// Wait until the task reaches a terminal state.
    ///
    /// With a `timeout`, fails with [`SchedulerError::TimedOut`] once it
    /// elapses; the task itself is left untouched.
    pub async fn get_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskResult, SchedulerError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_for_terminal(task_id))
                .await
                .map_err(|_| SchedulerError::TimedOut {
                    task_id: task_id.to_string(),
                    timeout: limit,
                })?,
            None => self.wait_for_terminal(task_id).await,
        }
    }

    async fn wait_for_terminal(&self, task_id: &str) -> Result<TaskResult, SchedulerError> {
        loop {
            let notified = self.inner.task_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.lock_state();
                let Some(task) = state.tasks.get(task_id) else {
                    return Err(SchedulerError::UnknownTaskId(task_id.to_string()));
                };
                if task.status.is_terminal() {
                    return Ok(task.to_result());
                }
            }

            notified.await;
        }
    }

    /// Tasks in submission order, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskSnapshot> {
        let state = self.inner.lock_state();
        let mut tasks: Vec<&Task> = state
            .tasks
            .values()
            .filter(|task| status.map_or(true, |wanted| task.status == wanted))
            .collect();
        tasks.sort_by_key(|task| task.order);
        tasks.into_iter().map(Task::snapshot).collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.lock_state();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        for task in state.tasks.values() {
            *by_status.entry(task.status.to_string()).or_default() += 1;
        }
        SchedulerStats {
            total_tasks: state.tasks.len(),
            queued: state.queue.len(),
            running: state.running.len(),
            workers: self.inner.config.max_workers,
            by_status,
        }
    }

    /// Drop finished tasks whose completion is older than `ttl`, or the
    /// configured result TTL when `None`. Returns how many were removed.
    pub fn purge_expired(&self, ttl: Option<Duration>) -> usize {
        let ttl = ttl.unwrap_or(Duration::from_secs(self.inner.config.result_ttl_secs));
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let mut state = self.inner.lock_state();
        let SchedulerState { tasks, running, .. } = &mut *state;
        let before = tasks.len();
        tasks.retain(|id, task| {
            let expired = task.status.is_terminal()
                && !running.contains_key(id)
                && task.completed_at.is_some_and(|at| at <= cutoff);
            !expired
        });
        let removed = before - tasks.len();
        if removed > 0 {
            tracing::debug!("purged {removed} expired task results");
        }
        removed
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .pool
            .lock()
            .expect("scheduler pool mutex poisoned")
            .is_some()
    }

    /// Spawn the worker pool. Calling `start` on a running scheduler is a
    /// no-op. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut pool = self.inner.pool.lock().expect("scheduler pool mutex poisoned");
        if pool.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let workers = self.inner.config.max_workers.max(1);
        let handles = (0..workers)
            .map(|worker_id| {
                let inner = self.inner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker_loop(inner, worker_id, shutdown).await })
            })
            .collect();
        *pool = Some(WorkerPool { shutdown, handles });
        tracing::info!("task scheduler started with {workers} workers");
    }

    /// Stop the worker pool.
    ///
    /// With `wait`, in-flight tasks run to completion first. Without it,
    /// in-flight handlers are aborted and marked cancelled. Queued tasks stay
    /// queued for a later `start`.
    pub async fn stop(&self, wait: bool) {
        let pool = self
            .inner
            .pool
            .lock()
            .expect("scheduler pool mutex poisoned")
            .take();
        let Some(pool) = pool else {
            return;
        };

        pool.shutdown.cancel();
        if !wait {
            let state = self.inner.lock_state();
            for handle in state.running.values() {
                handle.abort();
            }
        }

        for handle in pool.handles {
            if let Err(error) = handle.await {
                tracing::warn!("scheduler worker exited abnormally: {error}");
            }
        }
        tracing::info!("task scheduler stopped");
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("max_workers", &self.inner.config.max_workers)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SchedulerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state mutex poisoned")
    }

    fn publish(&self, update: TaskUpdate) {
        // No subscribers is the common case.
        let _ = self.updates.send(update);
    }

    fn enqueue_new(
        &self,
        state: &mut SchedulerState,
        name: String,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
        options: TaskOptions,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let order = state.next_order;
        state.next_order += 1;

        let mut task = Task::new(task_id.clone(), name, handler, args, options, order);
        task.status = TaskStatus::Queued;
        state.queue.push(task.priority, task_id.clone());
        self.publish(TaskUpdate::from_task(&task));
        state.tasks.insert(task_id.clone(), task);

        self.work_available.notify_one();
        task_id
    }

    /// Pop the highest-priority runnable task, mark it running and spawn its
    /// handler. Entries for tasks that are no longer queued are discarded.
    ///
    /// `shutdown` is checked under the state lock: `stop` cancels it before
    /// aborting the running set, so a claim either sees the cancellation or
    /// is visible to that abort.
    fn claim_next(&self, shutdown: &CancellationToken) -> Option<Job> {
        let mut state = self.lock_state();
        if shutdown.is_cancelled()
            || state.queue.is_empty()
            || state.running.len() >= self.config.max_workers.max(1)
        {
            return None;
        }

        while let Some(task_id) = state.queue.pop() {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }

            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.attempts += 1;

            let ctx = TaskContext::new(task_id.clone(), task.attempts, task.shared.clone());
            let handler = task.handler.clone();
            let args = task.args.clone();
            let timeout = task.timeout;
            let update = TaskUpdate::from_task(task);

            let handle = tokio::spawn(async move { handler.run(ctx, args).await });
            state.running.insert(task_id.clone(), handle.abort_handle());
            drop(state);

            self.publish(update);
            return Some(Job {
                task_id,
                handle,
                timeout,
            });
        }
        None
    }

    async fn execute(&self, job: Job, worker_id: usize) {
        let Job {
            task_id,
            mut handle,
            timeout,
        } = job;
        tracing::debug!("worker {worker_id} executing task {task_id}");

        let attempt = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => Attempt::Finished(joined),
                Err(_) => {
                    handle.abort();
                    Attempt::TimedOut(limit)
                }
            },
            None => Attempt::Finished(handle.await),
        };

        self.finish(&task_id, attempt);
    }

    fn finish(&self, task_id: &str, attempt: Attempt) {
        let mut state = self.lock_state();
        state.running.remove(task_id);
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };

        if task.status == TaskStatus::Cancelled {
            // Cancelled while running: the outcome is discarded.
            tracing::info!("task {task_id} stopped after cancellation");
            drop(state);
            self.task_finished.notify_waiters();
            return;
        }

        let mut requeue = false;
        match attempt {
            Attempt::Finished(Ok(Ok(value))) => {
                task.result = Some(value);
                task.error = None;
                task.error_kind = None;
                task.status = TaskStatus::Completed;
                tracing::debug!("task {task_id} completed");
            }
            Attempt::Finished(Err(join_error)) if join_error.is_cancelled() => {
                task.status = TaskStatus::Cancelled;
                task.error_kind = Some(TaskErrorKind::Cancelled);
                task.error = Some("task aborted by scheduler shutdown".to_string());
                tracing::info!("task {task_id} aborted by scheduler shutdown");
            }
            Attempt::Finished(outcome) => {
                let message = match outcome {
                    Ok(Err(error)) => error.to_string(),
                    _ => "task handler panicked".to_string(),
                };
                task.error = Some(message.clone());
                if task.retries < task.max_retries {
                    task.retries += 1;
                    task.status = TaskStatus::Queued;
                    requeue = true;
                    tracing::warn!(
                        "task {task_id} failed, retrying ({}/{}): {message}",
                        task.retries,
                        task.max_retries
                    );
                } else {
                    task.status = TaskStatus::Failed;
                    task.error_kind = Some(TaskErrorKind::Handler);
                    tracing::error!("task {task_id} failed: {message}");
                }
            }
            Attempt::TimedOut(limit) => {
                task.status = TaskStatus::Failed;
                task.error_kind = Some(TaskErrorKind::Timeout);
                task.error = Some(format!("task timed out after {}s", limit.as_secs_f64()));
                tracing::error!("task {task_id} timed out");
            }
        }

        if !requeue {
            task.completed_at = Some(Utc::now());
        }
        let priority = task.priority;
        let update = TaskUpdate::from_task(task);
        if requeue {
            state.queue.push(priority, task_id.to_string());
        }
        drop(state);

        self.publish(update);
        if requeue {
            self.work_available.notify_one();
        } else {
            self.task_finished.notify_waiters();
        }
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker_id: usize, shutdown: CancellationToken) {
    tracing::debug!("scheduler worker {worker_id} started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // Register interest before looking at the queue so a submit landing
        // in between still wakes this worker.
        let notified = inner.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(job) = inner.claim_next(&shutdown) {
            inner.execute(job, worker_id).await;
            continue;
        }

        tokio::select! {
            _ = notified.as_mut() => {}
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::debug!("scheduler worker {worker_id} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scheduler(workers: usize) -> TaskScheduler {
        TaskScheduler::new(SchedulerConfig {
            max_workers: workers,
            ..SchedulerConfig::default()
        })
    }

    async fn echo(_ctx: TaskContext, args: TaskArgs) -> Result<Value, HandlerError> {
        Ok(json!({"args": args.args, "kwargs": args.kwargs}))
    }

    #[tokio::test]
    async fn test_submit_unknown_task_fails() {
        let scheduler = scheduler(1);
        let err = scheduler
            .submit("missing", TaskArgs::new(), None)
            .unwrap_err();
        assert_eq!(err, SchedulerError::UnknownTask("missing".to_string()));
    }

    #[tokio::test]
    async fn test_submitted_task_is_queued_until_started() {
        let scheduler = scheduler(2);
        scheduler.register("echo", echo, TaskOptions::default());
        let id = scheduler.submit("echo", TaskArgs::new().arg(1), None).unwrap();
        assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Queued));

        let stats = scheduler.stats();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.workers, 2);
    }

    #[tokio::test]
    async fn test_args_and_kwargs_reach_handler() {
        let scheduler = scheduler(1);
        scheduler.register("echo", echo, TaskOptions::default());
        scheduler.start();

        let id = scheduler
            .submit("echo", TaskArgs::new().arg(3).arg(4).kwarg("op", "add"), None)
            .unwrap();
        let result = scheduler
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(json!({"args": [3, 4], "kwargs": {"op": "add"}})));
        assert_eq!(result.attempts, 1);

        scheduler.stop(true).await;
    }

    #[tokio::test]
    async fn test_cancel_queued_task_is_immediate() {
        let scheduler = scheduler(1);
        scheduler.register("echo", echo, TaskOptions::default());
        let id = scheduler.submit("echo", TaskArgs::new(), None).unwrap();

        assert!(scheduler.cancel(&id));
        assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Cancelled));
        assert!(!scheduler.cancel(&id));
        assert!(!scheduler.cancel("nope"));

        let result = scheduler.get_result(&id, None).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.error_kind, Some(TaskErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_submit_raw_runs_without_registration() {
        let scheduler = scheduler(1);
        scheduler.start();

        let id = scheduler.submit_raw(
            "adhoc",
            echo,
            TaskArgs::new().kwarg("k", "v"),
            TaskOptions::default().priority(TaskPriority::High),
        );
        assert!(!scheduler.is_registered("adhoc"));

        let result = scheduler
            .get_result(&id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(json!({"args": [], "kwargs": {"k": "v"}})));
        assert_eq!(scheduler.get_task(&id).unwrap().name, "adhoc");

        scheduler.register("echo", echo, TaskOptions::default());
        assert!(scheduler.is_registered("echo"));
        scheduler.stop(true).await;
    }

    #[tokio::test]
    async fn test_get_result_unknown_id() {
        let scheduler = scheduler(1);
        let err = scheduler.get_result("nope", None).await.unwrap_err();
        assert_eq!(err, SchedulerError::UnknownTaskId("nope".to_string()));
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_unfinished_tasks() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            max_workers: 1,
            result_ttl_secs: 0,
            ..SchedulerConfig::default()
        });
        scheduler.register("echo", echo, TaskOptions::default());
        let done = scheduler.submit("echo", TaskArgs::new(), None).unwrap();
        let pending = scheduler.submit("echo", TaskArgs::new(), None).unwrap();
        scheduler.cancel(&done);

        assert_eq!(scheduler.purge_expired(None), 1);
        assert!(scheduler.get_task(&done).is_none());
        assert!(scheduler.get_task(&pending).is_some());
    }

    #[tokio::test]
    async fn test_no_claim_after_shutdown_signal() {
        let scheduler = scheduler(1);
        scheduler.register("echo", echo, TaskOptions::default());
        let id = scheduler.submit("echo", TaskArgs::new(), None).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(scheduler.inner.claim_next(&shutdown).is_none());
        assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Queued));
        assert_eq!(scheduler.stats().running, 0);

        let job = scheduler.inner.claim_next(&CancellationToken::new()).unwrap();
        assert_eq!(job.task_id, id);
        assert_eq!(scheduler.get_status(&id), Some(TaskStatus::Running));
        job.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let scheduler = scheduler(2);
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop(true).await;
        scheduler.stop(true).await;
        assert!(!scheduler.is_running());
    }
}
