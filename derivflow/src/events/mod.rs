//! Engine events for observability.
//!
//! The runner and executor report progress through an [`EventSink`]. Sinks
//! never influence execution; a failing sink only logs.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;

/// Well-known event names.
pub mod names {
    /// A run began executing nodes.
    pub const RUN_STARTED: &str = "run.started";
    /// A run was finalized.
    pub const RUN_FINISHED: &str = "run.finished";
    /// A node began.
    pub const NODE_STARTED: &str = "node.started";
    /// A node finished with at least one usable subject.
    pub const NODE_COMPLETED: &str = "node.completed";
    /// A node failed for every subject or never started.
    pub const NODE_FAILED: &str = "node.failed";
    /// A subject was computed.
    pub const SUBJECT_PROCESSED: &str = "subject.processed";
    /// A subject reused its previous result.
    pub const SUBJECT_SKIPPED: &str = "subject.skipped";
    /// A subject failed in this node.
    pub const SUBJECT_FAILED: &str = "subject.failed";
    /// A subject failed upstream.
    pub const SUBJECT_PREVIOUS_ERROR: &str = "subject.previous_error";
    /// Stale derivative directories were removed.
    pub const DERIVATIVES_REMOVED: &str = "derivatives.removed";
}

/// An event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    /// Event name, one of [`names`].
    pub name: &'static str,
    /// Run id the event belongs to.
    pub run_id: String,
    /// Node id, for node and subject events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Extra data.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl EngineEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn run(name: &'static str, run_id: impl Into<String>) -> Self {
        Self {
            name,
            run_id: run_id.into(),
            node_id: None,
            data: serde_json::Value::Null,
        }
    }

    /// Creates a node-level event.
    #[must_use]
    pub fn node(name: &'static str, run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::run(name, run_id)
        }
    }

    /// Attaches data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
