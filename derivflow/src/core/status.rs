//! Subject status, node outcome status and node kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of analysis a node performs (e.g. `alignment`, `segment1`).
///
/// Kinds key the node registry and tag each ledger so downstream nodes can
/// check what they are connected to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKind(String);

impl NodeKind {
    /// Kind used when nothing more specific is known.
    pub const UNDEFINED: &'static str = "undefined";

    /// Creates a node kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The undefined kind.
    #[must_use]
    pub fn undefined() -> Self {
        Self::new(Self::UNDEFINED)
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeKind {
    fn default() -> Self {
        Self::undefined()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for NodeKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Analysis status of one subject within one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Created, not yet looked at.
    Waiting,
    /// The node function is running for this subject.
    Processing,
    /// The node function succeeded.
    Processed,
    /// This node failed for this subject.
    Error,
    /// An upstream node failed for this subject; nothing was attempted.
    PreviousError,
    /// A previous result was reused.
    Skipped,
}

impl Default for AnalysisStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Error => write!(f, "error"),
            Self::PreviousError => write!(f, "previous_error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl AnalysisStatus {
    /// Returns true if the status is terminal for a node execution.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Processed | Self::Error | Self::PreviousError | Self::Skipped
        )
    }

    /// Returns true if the subject has usable output for downstream nodes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Processed | Self::Skipped)
    }

    /// Returns true if the subject failed here or upstream.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::PreviousError)
    }

    /// Status message written to run documents.
    ///
    /// Both failure variants share the `failure` message.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Processed => "success",
            Self::Error | Self::PreviousError => "failure",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if a record may move from `self` to `next`.
    ///
    /// Statuses only move forward: `waiting -> processing -> {processed, error}`,
    /// or straight from `waiting` to `skipped`, `previous_error` or `error`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Waiting => matches!(
                next,
                Self::Processing | Self::Skipped | Self::PreviousError | Self::Error
            ),
            Self::Processing => matches!(next, Self::Processed | Self::Error),
            Self::Processed | Self::Error | Self::PreviousError | Self::Skipped => false,
        }
    }
}

/// Aggregate status of a node outcome or a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Not finished yet.
    Running,
    /// Finished with at least one usable subject.
    Success,
    /// Finished with no usable subject, or never started.
    Error,
}

impl Default for OutcomeStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl OutcomeStatus {
    /// Folds node statuses into a run status.
    ///
    /// Running while any node is running; error if any node errored;
    /// success otherwise.
    #[must_use]
    pub fn fold<'a>(statuses: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut any_error = false;
        for status in statuses {
            match status {
                Self::Running => return Self::Running,
                Self::Error => any_error = true,
                Self::Success => {}
            }
        }
        if any_error {
            Self::Error
        } else {
            Self::Success
        }
    }
}
