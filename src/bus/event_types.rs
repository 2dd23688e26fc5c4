//! Hook event and priority catalogue.
//!
//! Single source of truth for the lifecycle extension points the rest of the
//! agent can observe or intercept, and for which of them are allowed to
//! rewrite or cancel their payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved payload key a handler sets to `true` to cancel dispatch.
pub const CANCEL_KEY: &str = "_cancel";

/// Version of the hook event catalogue. Bumped whenever an event is added,
/// renamed or changes payload shape.
pub const HOOK_EVENTS_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Every hook event in the agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    // Capture
    PreCapture,
    PostCapture,
    CaptureError,

    // Inference
    PreInference,
    PostInference,
    InferenceError,

    // Execution
    PreExecute,
    PostExecute,
    ExecuteError,
    /// A safety guard refused the action.
    ExecuteBlocked,

    // Memory
    PreMemoryStore,
    PostMemoryStore,
    PreMemoryRetrieve,
    PostMemoryRetrieve,

    // Session
    SessionStart,
    SessionEnd,
    SessionPause,
    SessionResume,

    // Curiosity
    PreCuriosity,
    PostCuriosity,
    QuestionGenerated,

    // Learning
    PreLearn,
    PostLearn,
    ModelUpdate,

    // System
    Startup,
    Shutdown,
    ConfigChange,
    Error,

    // Plugins
    PluginLoad,
    PluginUnload,
    PluginError,
}

impl HookEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreCapture => "pre_capture",
            Self::PostCapture => "post_capture",
            Self::CaptureError => "capture_error",
            Self::PreInference => "pre_inference",
            Self::PostInference => "post_inference",
            Self::InferenceError => "inference_error",
            Self::PreExecute => "pre_execute",
            Self::PostExecute => "post_execute",
            Self::ExecuteError => "execute_error",
            Self::ExecuteBlocked => "execute_blocked",
            Self::PreMemoryStore => "pre_memory_store",
            Self::PostMemoryStore => "post_memory_store",
            Self::PreMemoryRetrieve => "pre_memory_retrieve",
            Self::PostMemoryRetrieve => "post_memory_retrieve",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::SessionPause => "session_pause",
            Self::SessionResume => "session_resume",
            Self::PreCuriosity => "pre_curiosity",
            Self::PostCuriosity => "post_curiosity",
            Self::QuestionGenerated => "question_generated",
            Self::PreLearn => "pre_learn",
            Self::PostLearn => "post_learn",
            Self::ModelUpdate => "model_update",
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::ConfigChange => "config_change",
            Self::Error => "error",
            Self::PluginLoad => "plugin_load",
            Self::PluginUnload => "plugin_unload",
            Self::PluginError => "plugin_error",
        }
    }

    pub const fn all() -> &'static [HookEvent] {
        &[
            HookEvent::PreCapture,
            HookEvent::PostCapture,
            HookEvent::CaptureError,
            HookEvent::PreInference,
            HookEvent::PostInference,
            HookEvent::InferenceError,
            HookEvent::PreExecute,
            HookEvent::PostExecute,
            HookEvent::ExecuteError,
            HookEvent::ExecuteBlocked,
            HookEvent::PreMemoryStore,
            HookEvent::PostMemoryStore,
            HookEvent::PreMemoryRetrieve,
            HookEvent::PostMemoryRetrieve,
            HookEvent::SessionStart,
            HookEvent::SessionEnd,
            HookEvent::SessionPause,
            HookEvent::SessionResume,
            HookEvent::PreCuriosity,
            HookEvent::PostCuriosity,
            HookEvent::QuestionGenerated,
            HookEvent::PreLearn,
            HookEvent::PostLearn,
            HookEvent::ModelUpdate,
            HookEvent::Startup,
            HookEvent::Shutdown,
            HookEvent::ConfigChange,
            HookEvent::Error,
            HookEvent::PluginLoad,
            HookEvent::PluginUnload,
            HookEvent::PluginError,
        ]
    }

    /// Documented payload shape and modification policy, when the event has
    /// one. Policy layers should refuse rewrites/cancellation the metadata
    /// does not allow.
    pub fn metadata(&self) -> Option<HookEventMetadata> {
        let meta = match self {
            Self::PreCapture => HookEventMetadata {
                description: "Before capturing input events",
                payload: &[("capture_type", "str"), ("config", "dict")],
                can_modify: true,
                can_cancel: true,
            },
            Self::PostCapture => HookEventMetadata {
                description: "After capturing input events",
                payload: &[("events", "list[Event]"), ("session_id", "str")],
                can_modify: true,
                can_cancel: false,
            },
            Self::PreInference => HookEventMetadata {
                description: "Before sending to the language model",
                payload: &[("prompt", "str"), ("context", "dict"), ("model", "str")],
                can_modify: true,
                can_cancel: true,
            },
            Self::PostInference => HookEventMetadata {
                description: "After receiving the language model response",
                payload: &[
                    ("response", "str"),
                    ("tokens_used", "int"),
                    ("latency_ms", "float"),
                ],
                can_modify: true,
                can_cancel: false,
            },
            Self::PreExecute => HookEventMetadata {
                description: "Before executing an action",
                payload: &[("action", "Action"), ("safety_check", "bool")],
                can_modify: true,
                can_cancel: true,
            },
            Self::PostExecute => HookEventMetadata {
                description: "After executing an action",
                payload: &[("action", "Action"), ("result", "ActionResult")],
                can_modify: false,
                can_cancel: false,
            },
            Self::SessionStart => HookEventMetadata {
                description: "When a recording session starts",
                payload: &[("session_id", "str"), ("name", "str"), ("config", "dict")],
                can_modify: true,
                can_cancel: true,
            },
            Self::SessionEnd => HookEventMetadata {
                description: "When a recording session ends",
                payload: &[
                    ("session_id", "str"),
                    ("event_count", "int"),
                    ("duration_seconds", "float"),
                ],
                can_modify: false,
                can_cancel: false,
            },
            Self::Error => HookEventMetadata {
                description: "When an error occurs anywhere in the system",
                payload: &[("error", "str"), ("context", "str"), ("recoverable", "bool")],
                can_modify: false,
                can_cancel: false,
            },
            _ => return None,
        };
        Some(meta)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim().to_ascii_lowercase();
        HookEvent::all()
            .iter()
            .copied()
            .find(|event| event.as_str() == needle)
            .ok_or_else(|| format!("unknown hook event: {value}"))
    }
}

/// Documentation and policy flags for one hook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookEventMetadata {
    pub description: &'static str,
    /// `(field, type)` pairs of the documented payload.
    pub payload: &'static [(&'static str, &'static str)],
    pub can_modify: bool,
    pub can_cancel: bool,
}

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

/// Handler priority. Higher runs first; most handlers should use `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HookPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    /// Reserved for internal handlers.
    System,
}

impl HookPriority {
    pub const fn value(&self) -> u8 {
        match self {
            Self::Lowest => 0,
            Self::Low => 25,
            Self::Normal => 50,
            Self::High => 75,
            Self::Highest => 100,
            Self::System => 200,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lowest => "LOWEST",
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Highest => "HIGHEST",
            Self::System => "SYSTEM",
        }
    }
}

impl PartialOrd for HookPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HookPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_event_round_trips_through_its_wire_name() {
        for event in HookEvent::all() {
            assert_eq!(event.as_str().parse::<HookEvent>().unwrap(), *event);
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json, serde_json::Value::String(event.as_str().to_string()));
        }
    }

    #[test]
    fn test_priorities_order_by_value() {
        assert!(HookPriority::System > HookPriority::Highest);
        assert!(HookPriority::Highest > HookPriority::High);
        assert!(HookPriority::High > HookPriority::Normal);
        assert!(HookPriority::Normal > HookPriority::Low);
        assert!(HookPriority::Low > HookPriority::Lowest);
    }

    #[test]
    fn test_post_execute_is_read_only() {
        let meta = HookEvent::PostExecute.metadata().unwrap();
        assert!(!meta.can_modify);
        assert!(!meta.can_cancel);
        assert!(HookEvent::PluginLoad.metadata().is_none());
    }
}
