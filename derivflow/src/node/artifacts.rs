//! Named artifacts passed into and out of node functions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ledger::AnalysisLedger;

/// Well-known key carrying the analysis ledger between nodes.
pub const LEDGER_KEY: &str = "analysis_info";

/// One named input or output of a node function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    /// A single file or directory.
    Path(PathBuf),
    /// Several files or directories, in production order.
    Paths(Vec<PathBuf>),
    /// An analysis ledger.
    Ledger(AnalysisLedger),
    /// Any other value, opaque to the engine.
    Value(serde_json::Value),
}

impl Artifact {
    /// Paths held by the artifact, if it holds any.
    #[must_use]
    pub fn paths(&self) -> Vec<&PathBuf> {
        match self {
            Self::Path(p) => vec![p],
            Self::Paths(ps) => ps.iter().collect(),
            Self::Ledger(_) | Self::Value(_) => Vec::new(),
        }
    }
}

/// Named artifacts in insertion order. Keys are unique.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeArtifacts {
    entries: Vec<(String, Artifact)>,
}

impl NodeArtifacts {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an artifact.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, artifact: Artifact) -> Self {
        self.insert(key, artifact);
        self
    }

    /// Adds a path artifact.
    #[must_use]
    pub fn with_path(self, key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with(key, Artifact::Path(path.into()))
    }

    /// Adds or replaces an artifact in place.
    pub fn insert(&mut self, key: impl Into<String>, artifact: Artifact) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = artifact,
            None => self.entries.push((key, artifact)),
        }
    }

    /// Returns an artifact by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Artifact> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, a)| a)
    }

    /// Returns the ledger carried under [`LEDGER_KEY`].
    #[must_use]
    pub fn ledger(&self) -> Option<&AnalysisLedger> {
        match self.get(LEDGER_KEY) {
            Some(Artifact::Ledger(ledger)) => Some(ledger),
            _ => None,
        }
    }

    /// Every path across all artifacts, in insertion order.
    #[must_use]
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .flat_map(|(_, a)| a.paths())
            .cloned()
            .collect()
    }

    /// Iterates over `(key, artifact)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.entries.iter().map(|(k, a)| (k.as_str(), a))
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
