//! Error types for the derivflow engine.
//!
//! Per-subject failures never surface here: they are captured in the
//! subject's [`AnalysisRecord`](crate::core::AnalysisRecord). The variants
//! below are the conditions that are fatal to a call, a node or a run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::AnalysisStatus;

/// The main error type for derivflow operations.
#[derive(Debug, Error)]
pub enum DerivflowError {
    /// A subject was addressed that is not part of the declared subject set.
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),

    /// Two subjects would share one derivative directory.
    #[error("Subjects '{first}' and '{second}' share the file stem '{stem}'")]
    DuplicateSubjectStem {
        /// The shared stem.
        stem: String,
        /// Subject declared first.
        first: String,
        /// Subject declared later.
        second: String,
    },

    /// A required upstream derivative is absent.
    #[error("input missing: {}", .0.display())]
    InputMissing(PathBuf),

    /// The opaque node function failed for one subject.
    #[error("{0}")]
    NodeFunctionFailure(#[from] FailureDetail),

    /// Every subject of a node ended in error.
    #[error("All the processings were failed in node '{node_id}' ({failed} subjects)")]
    AllSubjectsFailed {
        /// Node that failed.
        node_id: String,
        /// Number of failed subjects.
        failed: usize,
    },

    /// The run recorder could not write or read its documents.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A record status was moved backwards or sideways.
    #[error("Invalid status transition for '{subject}': {from} -> {to}")]
    InvalidTransition {
        /// Subject whose record was touched.
        subject: String,
        /// Current status.
        from: AnalysisStatus,
        /// Requested status.
        to: AnalysisStatus,
    },

    /// A node was wired after an upstream kind it does not accept.
    #[error("Node '{node_id}' of kind '{kind}' cannot follow a '{upstream_kind}' node")]
    InvalidConnection {
        /// Node that declares the restriction.
        node_id: String,
        /// Its kind.
        kind: String,
        /// Kind of the offending upstream node.
        upstream_kind: String,
    },

    /// No function is registered for a node kind.
    #[error("No node function registered for kind '{0}'")]
    UnknownNodeKind(String),

    /// A run was requested that does not exist.
    #[error("Run '{run_id}' not found in project '{project_id}'")]
    RunNotFound {
        /// Project identifier.
        project_id: String,
        /// Run identifier.
        run_id: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DerivflowError {
    /// Creates a persistence error from any displayable cause.
    pub fn persistence(cause: impl std::fmt::Display) -> Self {
        Self::Persistence(cause.to_string())
    }
}

impl From<serde_json::Error> for DerivflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for DerivflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Formatted detail of a node function failure.
///
/// Only the trailing causes of the error chain are retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Subject label the failure belongs to.
    pub subject: String,
    /// Top-level error message.
    pub message: String,
    /// Retained causes, outermost first.
    #[serde(default)]
    pub causes: Vec<String>,
}

impl FailureDetail {
    /// Creates a new failure detail.
    #[must_use]
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Builds a failure detail from an error chain, keeping the last `depth` causes.
    #[must_use]
    pub fn from_error(subject: impl Into<String>, err: &anyhow::Error, depth: usize) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let keep = chain.len().saturating_sub(depth);
        Self {
            subject: subject.into(),
            message: err.to_string(),
            causes: chain.into_iter().skip(keep).collect(),
        }
    }

    /// Builds a failure detail from a panic payload.
    #[must_use]
    pub fn from_panic(subject: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "node function panicked".to_string());
        Self::new(subject, format!("panic: {message}"))
    }

    /// Renders the detail as the text stored in a record's message.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("[Error ({})]\n{}", self.subject, self.message);
        for cause in &self.causes {
            out.push_str("\n  caused by: ");
            out.push_str(cause);
        }
        out
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for FailureDetail {}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The nodes involved in the error.
    pub nodes: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the nodes involved.
    #[must_use]
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Pipeline contains a cycle: {}", .cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The nodes forming the cycle, first node repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}
