//! Hook system for intercepting the agent pipeline.
//!
//! The event bus provides:
//! - Named lifecycle hooks around capture, inference and execution stages
//! - Priority-ordered dispatch with payload rewriting and cancellation
//! - Error isolation: one failing handler never stops its siblings
//! - Per-handler call counts and timing
//!
//! # Architecture
//!
//! Producers call `EventBus::trigger` around a pipeline stage and inspect
//! the returned `DispatchResult`:
//! - `event_types`: the closed catalogue of hook events and priorities
//! - `event_bus`: registration, dispatch and introspection

mod event_bus;
mod event_types;

use thiserror::Error;

pub use event_bus::{
    DispatchResult, EventBus, HandlerFailure, HandlerRegistration, HandlerStats, HookHandler,
    HookOptions, HookOutcome, HookPayload,
};
pub use event_types::{
    HookEvent, HookEventMetadata, HookPriority, CANCEL_KEY, HOOK_EVENTS_VERSION,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("handler with name '{0}' already registered")]
    DuplicateName(String),
}
