use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::HandlerError;

// ---------------------------------------------------------------------------
// Status and priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task urgency. Higher values are executed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const fn value(&self) -> u8 {
        match self {
            Self::Low => 10,
            Self::Normal => 50,
            Self::High => 75,
            Self::Critical => 100,
        }
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

/// Why a task ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The handler returned an error (or panicked) on its final attempt.
    Handler,
    /// The handler exceeded the task timeout. Never retried.
    Timeout,
    /// The task was cancelled before or during execution.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Positional and keyword arguments supplied at submission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn keyword(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Read `args` (array) and `kwargs` (object) out of a message payload.
    /// Missing or mistyped fields are treated as empty.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let args = payload
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let kwargs = payload
            .get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self { args, kwargs }
    }
}

/// Progress as last reported by a running handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskProgress {
    pub fraction: f32,
    pub message: String,
}

pub(crate) struct TaskShared {
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: Mutex<TaskProgress>,
}

impl TaskShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            progress: Mutex::new(TaskProgress::default()),
        })
    }

    pub(crate) fn progress(&self) -> TaskProgress {
        self.progress.lock().expect("task progress mutex poisoned").clone()
    }
}

/// Handed to every handler invocation.
///
/// Cancelling a running task only fires the token exposed here; a handler
/// that wants to stop early must poll [`TaskContext::is_cancelled`] or await
/// [`TaskContext::cancelled`].
#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    attempt: u32,
    shared: Arc<TaskShared>,
}

impl TaskContext {
    pub(crate) fn new(task_id: String, attempt: u32, shared: Arc<TaskShared>) -> Self {
        Self {
            task_id,
            attempt,
            shared,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 1 for the first invocation, 2 for the first retry, ...
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Record progress; `fraction` is clamped to `0.0..=1.0`. An empty
    /// message keeps the previous one.
    pub fn report_progress(&self, fraction: f32, message: impl Into<String>) {
        let message = message.into();
        let mut guard = self.shared.progress.lock().expect("task progress mutex poisoned");
        guard.fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        if !message.is_empty() {
            guard.message = message;
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Background work addressed by name at submission.
///
/// Any `Fn(TaskContext, TaskArgs) -> impl Future<Output = Result<Value, HandlerError>>`
/// closure is a handler.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext, args: TaskArgs) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, args: TaskArgs) -> Result<Value, HandlerError> {
        (self)(ctx, args).await
    }
}

// ---------------------------------------------------------------------------
// Definitions and records
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-task execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    pub priority: TaskPriority,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl TaskOptions {
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A registered, reusable task type.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub options: TaskOptions,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Scheduler-owned state of one submitted task.
pub(crate) struct Task {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) args: TaskArgs,
    pub(crate) priority: TaskPriority,
    pub(crate) status: TaskStatus,
    pub(crate) order: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
    pub(crate) error_kind: Option<TaskErrorKind>,
    pub(crate) retries: u32,
    pub(crate) max_retries: u32,
    pub(crate) attempts: u32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) shared: Arc<TaskShared>,
}

impl Task {
    pub(crate) fn new(
        id: String,
        name: String,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
        options: TaskOptions,
        order: u64,
    ) -> Self {
        Self {
            id,
            name,
            handler,
            args,
            priority: options.priority,
            status: TaskStatus::Pending,
            order,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_kind: None,
            retries: 0,
            max_retries: options.max_retries,
            attempts: 0,
            timeout: options.timeout,
            shared: TaskShared::new(),
        }
    }

    pub(crate) fn to_result(&self) -> TaskResult {
        TaskResult {
            task_id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            attempts: self.attempts,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        let progress = self.shared.progress();
        TaskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
            priority: self.priority,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            progress: progress.fraction,
            progress_message: progress.message,
            retries: self.retries,
            max_retries: self.max_retries,
            attempts: self.attempts,
            timeout_ms: self
                .timeout
                .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// Immutable result of a task, meaningful once `status.is_terminal()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<TaskErrorKind>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// Full point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub args: TaskArgs,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<TaskErrorKind>,
    pub progress: f32,
    pub progress_message: String,
    pub retries: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub timeout_ms: Option<u64>,
}

/// Published on every status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskUpdate {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskUpdate {
    pub(crate) fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            attempts: task.attempts,
            error: task.error.clone(),
            at: Utc::now(),
        }
    }
}
