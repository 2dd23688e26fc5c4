use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::event_types::{HookEvent, HookPriority, CANCEL_KEY};
use super::BusError;
use crate::HandlerError;

/// String-keyed payload handed from handler to handler.
pub type HookPayload = serde_json::Map<String, Value>;

/// What a hook handler produces: `Ok(None)` keeps the current payload,
/// `Ok(Some(..))` replaces it.
pub type HookOutcome = Result<Option<HookPayload>, HandlerError>;

/// A callable subscribed to one or more hook events.
///
/// Any `Fn(HookPayload) -> impl Future<Output = HookOutcome>` closure is a
/// handler.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, payload: HookPayload) -> HookOutcome;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookOutcome> + Send + 'static,
{
    async fn handle(&self, payload: HookPayload) -> HookOutcome {
        (self)(payload).await
    }
}

/// Registration options. Defaults to `NORMAL` priority, an auto-generated
/// name and the `user` source.
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    pub priority: HookPriority,
    pub name: Option<String>,
    pub source: Option<String>,
}

impl HookOptions {
    pub fn priority(mut self, priority: HookPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

const DEFAULT_SOURCE: &str = "user";

struct RegisteredHandler {
    event: HookEvent,
    handler: Arc<dyn HookHandler>,
    priority: HookPriority,
    name: String,
    source: String,
    enabled: AtomicBool,
    registered_at: DateTime<Utc>,
    call_count: AtomicU64,
    total_time_ns: AtomicU64,
}

impl RegisteredHandler {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn record_call(&self, elapsed: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    fn total_time_ms(&self) -> f64 {
        self.total_time_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn snapshot(&self) -> HandlerRegistration {
        HandlerRegistration {
            event: self.event,
            priority: self.priority,
            name: self.name.clone(),
            source: self.source.clone(),
            enabled: self.is_enabled(),
            registered_at: self.registered_at,
            call_count: self.call_count.load(Ordering::Relaxed),
            total_time_ms: self.total_time_ms(),
        }
    }
}

/// Point-in-time view of a registered handler.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerRegistration {
    pub event: HookEvent,
    pub priority: HookPriority,
    pub name: String,
    pub source: String,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
    pub call_count: u64,
    pub total_time_ms: f64,
}

/// Per-handler performance counters as reported by [`EventBus::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub event: HookEvent,
    pub priority: &'static str,
    pub enabled: bool,
    pub call_count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
}

/// A handler that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of one `trigger` / `trigger_parallel` call.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub event: HookEvent,
    pub payload: HookPayload,
    pub handlers_called: usize,
    pub cancelled: bool,
    pub errors: Vec<HandlerFailure>,
    pub duration: Duration,
}

impl DispatchResult {
    fn empty(event: HookEvent, payload: HookPayload) -> Self {
        Self {
            event,
            payload,
            handlers_called: 0,
            cancelled: false,
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn total_time_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
struct Registry {
    by_event: HashMap<HookEvent, Vec<Arc<RegisteredHandler>>>,
    by_name: HashMap<String, Arc<RegisteredHandler>>,
    next_auto_id: u64,
}

/// Registers and dispatches named lifecycle hooks.
///
/// Handlers for an event are kept sorted by priority (highest first); ties
/// keep registration order. Dispatch works on a snapshot of the handler list,
/// so handlers may register or unregister other handlers while an event is
/// being dispatched without deadlocking.
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register `handler` for `event` and return its unique name.
    pub fn register<H>(
        &self,
        event: HookEvent,
        handler: H,
        options: HookOptions,
    ) -> Result<String, BusError>
    where
        H: HookHandler + 'static,
    {
        self.register_arc(event, Arc::new(handler), options)
    }

    /// Registration sugar: `NORMAL` priority, generated name, `user` source.
    pub fn on<H>(&self, event: HookEvent, handler: H) -> Result<String, BusError>
    where
        H: HookHandler + 'static,
    {
        self.register(event, handler, HookOptions::default())
    }

    /// Register one handler for several events. Each registration is named
    /// `"{name}:{event}"`; all or none are registered.
    pub fn on_many<H>(
        &self,
        events: &[HookEvent],
        handler: H,
        options: HookOptions,
    ) -> Result<Vec<String>, BusError>
    where
        H: HookHandler + 'static,
    {
        let handler: Arc<dyn HookHandler> = Arc::new(handler);
        let base = options.name.clone();
        let mut names = Vec::with_capacity(events.len());
        for event in events {
            let mut per_event = options.clone();
            per_event.name = base.as_ref().map(|name| format!("{name}:{event}"));
            match self.register_arc(*event, handler.clone(), per_event) {
                Ok(name) => names.push(name),
                Err(error) => {
                    for name in &names {
                        self.unregister(name);
                    }
                    return Err(error);
                }
            }
        }
        Ok(names)
    }

    fn register_arc(
        &self,
        event: HookEvent,
        handler: Arc<dyn HookHandler>,
        options: HookOptions,
    ) -> Result<String, BusError> {
        let source = options
            .source
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());

        let mut registry = self.registry.write().expect("event bus registry poisoned");
        let name = match options.name {
            Some(name) => name,
            None => {
                let id = registry.next_auto_id;
                registry.next_auto_id += 1;
                format!("{source}:{event}:{id}")
            }
        };

        if registry.by_name.contains_key(&name) {
            return Err(BusError::DuplicateName(name));
        }

        let registration = Arc::new(RegisteredHandler {
            event,
            handler,
            priority: options.priority,
            name: name.clone(),
            source,
            enabled: AtomicBool::new(true),
            registered_at: Utc::now(),
            call_count: AtomicU64::new(0),
            total_time_ns: AtomicU64::new(0),
        });

        let handlers = registry.by_event.entry(event).or_default();
        handlers.push(registration.clone());
        // Stable sort: equal priorities stay in registration order.
        handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
        registry.by_name.insert(name.clone(), registration);

        tracing::debug!("registered hook handler '{name}' for {event}");
        Ok(name)
    }

    /// Remove a handler by name. Returns `false` if no such handler exists.
    pub fn unregister(&self, name: &str) -> bool {
        let mut registry = self.registry.write().expect("event bus registry poisoned");
        let Some(registration) = registry.by_name.remove(name) else {
            return false;
        };
        if let Some(handlers) = registry.by_event.get_mut(&registration.event) {
            handlers.retain(|entry| entry.name != name);
            if handlers.is_empty() {
                registry.by_event.remove(&registration.event);
            }
        }
        tracing::debug!("unregistered hook handler '{name}'");
        true
    }

    /// Remove every handler registered with `source`, returning how many were
    /// removed.
    pub fn unregister_by_source(&self, source: &str) -> usize {
        let mut registry = self.registry.write().expect("event bus registry poisoned");
        let before = registry.by_name.len();
        registry.by_name.retain(|_, entry| entry.source != source);
        let removed = before - registry.by_name.len();
        if removed > 0 {
            registry.by_event.retain(|_, handlers| {
                handlers.retain(|entry| entry.source != source);
                !handlers.is_empty()
            });
            tracing::debug!("unregistered {removed} hook handlers from source '{source}'");
        }
        removed
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let registry = self.registry.read().expect("event bus registry poisoned");
        match registry.by_name.get(name) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn handlers_for(&self, event: HookEvent) -> Vec<Arc<RegisteredHandler>> {
        let registry = self.registry.read().expect("event bus registry poisoned");
        registry.by_event.get(&event).cloned().unwrap_or_default()
    }

    /// Dispatch `event` through its handlers in priority order, allowing
    /// cancellation.
    pub async fn trigger(&self, event: HookEvent, payload: HookPayload) -> DispatchResult {
        self.trigger_with(event, payload, true).await
    }

    /// Dispatch `event` sequentially.
    ///
    /// Each enabled handler gets an owned copy of the current payload; a
    /// returned payload replaces it for the next handler. With `allow_cancel`,
    /// a returned payload carrying `_cancel: true` stops dispatch and the
    /// result keeps the payload as it was before the cancelling handler ran.
    /// A failing handler is recorded and dispatch continues.
    pub async fn trigger_with(
        &self,
        event: HookEvent,
        payload: HookPayload,
        allow_cancel: bool,
    ) -> DispatchResult {
        let started = Instant::now();
        let handlers = self.handlers_for(event);
        let mut result = DispatchResult::empty(event, HookPayload::new());
        let mut current = payload;

        for registration in handlers {
            if !registration.is_enabled() {
                continue;
            }

            let handler_started = Instant::now();
            let outcome = AssertUnwindSafe(registration.handler.handle(current.clone()))
                .catch_unwind()
                .await;
            registration.record_call(handler_started.elapsed());

            match outcome {
                Ok(Ok(Some(next))) => {
                    // The cancelling handler is not counted as called.
                    if allow_cancel && is_cancel_requested(&next) {
                        result.cancelled = true;
                        tracing::info!(
                            "event {event} cancelled by handler '{}'",
                            registration.name
                        );
                        break;
                    }
                    result.handlers_called += 1;
                    current = next;
                }
                Ok(Ok(None)) => result.handlers_called += 1,
                Ok(Err(error)) => {
                    tracing::error!(
                        "hook handler '{}' failed for {event}: {error}",
                        registration.name
                    );
                    result.errors.push(HandlerFailure {
                        name: registration.name.clone(),
                        error: error.to_string(),
                    });
                }
                Err(_) => {
                    tracing::error!("hook handler '{}' panicked on {event}", registration.name);
                    result.errors.push(HandlerFailure {
                        name: registration.name.clone(),
                        error: "handler panicked".to_string(),
                    });
                }
            }
        }

        result.payload = current;
        result.duration = started.elapsed();
        result
    }

    /// Run every enabled handler concurrently against its own copy of the
    /// unmodified payload. No ordering, no payload merge, no cancellation.
    pub async fn trigger_parallel(&self, event: HookEvent, payload: HookPayload) -> DispatchResult {
        let started = Instant::now();
        let handlers = self.handlers_for(event);

        let calls = handlers
            .into_iter()
            .filter(|registration| registration.is_enabled())
            .map(|registration| {
                let payload = payload.clone();
                async move {
                    let handler_started = Instant::now();
                    let outcome = AssertUnwindSafe(registration.handler.handle(payload))
                        .catch_unwind()
                        .await;
                    registration.record_call(handler_started.elapsed());
                    let error = match outcome {
                        Ok(Ok(_)) => None,
                        Ok(Err(error)) => Some(error.to_string()),
                        Err(_) => Some("handler panicked".to_string()),
                    };
                    (registration.name.clone(), error)
                }
            });
        let outcomes = join_all(calls).await;

        let mut result = DispatchResult::empty(event, payload);
        for (name, error) in outcomes {
            match error {
                None => result.handlers_called += 1,
                Some(error) => {
                    tracing::error!("hook handler '{name}' failed for {event}: {error}");
                    result.errors.push(HandlerFailure { name, error });
                }
            }
        }
        result.duration = started.elapsed();
        result
    }

    /// Registered handlers, for one event in dispatch order or for all events.
    pub fn get_handlers(&self, event: Option<HookEvent>) -> Vec<HandlerRegistration> {
        let registry = self.registry.read().expect("event bus registry poisoned");
        match event {
            Some(event) => registry
                .by_event
                .get(&event)
                .map(|handlers| handlers.iter().map(|entry| entry.snapshot()).collect())
                .unwrap_or_default(),
            None => HookEvent::all()
                .iter()
                .filter_map(|event| registry.by_event.get(event))
                .flat_map(|handlers| handlers.iter().map(|entry| entry.snapshot()))
                .collect(),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.registry
            .read()
            .expect("event bus registry poisoned")
            .by_name
            .len()
    }

    pub fn get_stats(&self) -> BTreeMap<String, HandlerStats> {
        let registry = self.registry.read().expect("event bus registry poisoned");
        registry
            .by_name
            .iter()
            .map(|(name, entry)| {
                let call_count = entry.call_count.load(Ordering::Relaxed);
                let total_time_ms = entry.total_time_ms();
                let avg_time_ms = if call_count > 0 {
                    total_time_ms / call_count as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    HandlerStats {
                        event: entry.event,
                        priority: entry.priority.name(),
                        enabled: entry.is_enabled(),
                        call_count,
                        total_time_ms,
                        avg_time_ms,
                    },
                )
            })
            .collect()
    }

    /// Remove every registered handler.
    pub fn clear(&self) {
        let mut registry = self.registry.write().expect("event bus registry poisoned");
        registry.by_event.clear();
        registry.by_name.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

fn is_cancel_requested(payload: &HookPayload) -> bool {
    payload
        .get(CANCEL_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
