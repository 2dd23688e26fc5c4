//! Orchestration core for the digital twin agent.
//!
//! Three components let independent producers and consumers coordinate
//! without sharing mutable state:
//! - `bus`: priority-ordered lifecycle hooks with payload rewriting and
//!   cancellation
//! - `scheduler`: background tasks on a bounded worker pool with priorities,
//!   retries and timeouts
//! - `gateway`: sequenced multi-client event streaming with presence and
//!   heartbeat supervision
//!
//! # Architecture
//!
//! The components do not depend on each other. `routing` adapts inbound
//! gateway messages into hook triggers and task submissions, and
//! `context::AppContext` builds one instance of each and wires them
//! together. Everything else is configuration (`config`).

pub mod bus;
pub mod config;
pub mod context;
pub mod gateway;
pub mod routing;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use bus::{BusError, DispatchResult, EventBus, HookEvent, HookOptions, HookPriority};
pub use config::{ConfigError, CoreConfig, GatewayConfig, SchedulerConfig};
pub use context::AppContext;
pub use gateway::{Gateway, GatewayEvent, GatewayEventType, Transport, TransportError};
pub use scheduler::{
    SchedulerError, TaskArgs, TaskContext, TaskOptions, TaskPriority, TaskScheduler, TaskStatus,
};

// ---------------------------------------------------------------------------
// Shared error types
// ---------------------------------------------------------------------------

/// Error returned by user-supplied hook, task and gateway handlers. Only its
/// message is kept.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Bus(#[from] BusError),
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mnemosyne_core=debug,info".parse().expect("valid env filter")),
        )
        .try_init();
}
