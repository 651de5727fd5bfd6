//! Resume index: per node, per subject record of the last completed outcome.
//!
//! The index is read by the skip policy of the next run. It is stored apart
//! from the run manifest so that a run can resume from another run's index
//! without loading the whole manifest.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::artifact::file_digest;
use super::{read_json_opt, write_json_atomic, RunKey};
use crate::core::SubjectPath;
use crate::errors::DerivflowError;
use crate::ledger::AnalysisLedger;

/// Directory below a run directory holding the per-node resume indexes.
pub const RESUME_DIR_NAME: &str = "resume";

/// The recorded outcome of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeEntry {
    /// Output paths produced, or carried forward, for the subject.
    #[serde(default)]
    pub output_paths: Vec<String>,
    /// True if the subject ended processed or skipped.
    pub success: bool,
    /// Status message (`success`, `failure`, `skipped`).
    #[serde(default)]
    pub status: String,
    /// Free-text diagnostic.
    #[serde(default)]
    pub message: String,
    /// SHA-256 per output file, when digests are recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digests: Option<BTreeMap<String, String>>,
}

impl ResumeEntry {
    /// Creates a successful entry with the given outputs.
    #[must_use]
    pub fn success<I, S>(output_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            output_paths: output_paths.into_iter().map(Into::into).collect(),
            success: true,
            status: "success".to_string(),
            message: String::new(),
            digests: None,
        }
    }

    /// Creates a failed entry.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output_paths: Vec::new(),
            success: false,
            status: "failure".to_string(),
            message: message.into(),
            digests: None,
        }
    }

    /// Attaches content digests.
    #[must_use]
    pub fn with_digests(mut self, digests: BTreeMap<String, String>) -> Self {
        self.digests = Some(digests);
        self
    }
}

/// Resume entries of one node, keyed by canonical subject path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeIndex {
    entries: BTreeMap<SubjectPath, ResumeEntry>,
}

impl ResumeIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from a finished ledger.
    ///
    /// With `with_digests`, every output path that is a regular file gets a
    /// SHA-256 digest.
    ///
    /// # Errors
    ///
    /// Returns an error if an output file cannot be read for hashing.
    pub fn from_ledger(ledger: &AnalysisLedger, with_digests: bool) -> Result<Self, DerivflowError> {
        let mut entries = BTreeMap::new();
        for record in ledger.records() {
            let mut entry = ResumeEntry {
                output_paths: record.output_paths.clone(),
                success: record.status.is_success(),
                status: record.status.message().to_string(),
                message: record.message.clone(),
                digests: None,
            };
            if with_digests && entry.success {
                let mut digests = BTreeMap::new();
                for path in &record.output_paths {
                    if Path::new(path).is_file() {
                        digests.insert(path.clone(), file_digest(path)?);
                    }
                }
                entry.digests = Some(digests);
            }
            entries.insert(record.subject_path.clone(), entry);
        }
        Ok(Self { entries })
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, subject: SubjectPath, entry: ResumeEntry) {
        self.entries.insert(subject, entry);
    }

    /// Returns the entry of a subject.
    #[must_use]
    pub fn get(&self, subject: &SubjectPath) -> Option<&ResumeEntry> {
        self.entries.get(subject)
    }

    /// Iterates over entries in subject order.
    pub fn iter(&self) -> impl Iterator<Item = (&SubjectPath, &ResumeEntry)> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Storage backend for resume indexes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Loads a node's index, if one was recorded.
    async fn load_index(&self, run: &RunKey, node_id: &str) -> Result<Option<ResumeIndex>, DerivflowError>;

    /// Replaces a node's index.
    async fn save_index(&self, run: &RunKey, node_id: &str, index: &ResumeIndex) -> Result<(), DerivflowError>;

    /// Looks up one subject's entry.
    ///
    /// Called per subject at evaluation time, so the most recently persisted
    /// entry wins.
    async fn get_entry(
        &self,
        run: &RunKey,
        node_id: &str,
        subject: &SubjectPath,
    ) -> Result<Option<ResumeEntry>, DerivflowError> {
        Ok(self
            .load_index(run, node_id)
            .await?
            .and_then(|index| index.get(subject).cloned()))
    }
}

/// Resume indexes stored as one JSON document per (run, node).
#[derive(Debug, Clone)]
pub struct JsonFileResumeStore {
    workspace: PathBuf,
}

impl JsonFileResumeStore {
    /// Creates a store below a workspace directory.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Path of a node's resume index.
    #[must_use]
    pub fn index_path(&self, run: &RunKey, node_id: &str) -> PathBuf {
        run.dir_in(&self.workspace)
            .join(RESUME_DIR_NAME)
            .join(format!("{node_id}.json"))
    }
}

#[async_trait]
impl ResumeStore for JsonFileResumeStore {
    async fn load_index(&self, run: &RunKey, node_id: &str) -> Result<Option<ResumeIndex>, DerivflowError> {
        read_json_opt(&self.index_path(run, node_id)).await
    }

    async fn save_index(&self, run: &RunKey, node_id: &str, index: &ResumeIndex) -> Result<(), DerivflowError> {
        write_json_atomic(&self.index_path(run, node_id), index).await
    }
}

/// In-memory resume indexes.
#[derive(Debug, Default)]
pub struct InMemoryResumeStore {
    indexes: DashMap<(RunKey, String), ResumeIndex>,
}

impl InMemoryResumeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored indexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn load_index(&self, run: &RunKey, node_id: &str) -> Result<Option<ResumeIndex>, DerivflowError> {
        Ok(self
            .indexes
            .get(&(run.clone(), node_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn save_index(&self, run: &RunKey, node_id: &str, index: &ResumeIndex) -> Result<(), DerivflowError> {
        self.indexes
            .insert((run.clone(), node_id.to_string()), index.clone());
        Ok(())
    }

    async fn get_entry(
        &self,
        run: &RunKey,
        node_id: &str,
        subject: &SubjectPath,
    ) -> Result<Option<ResumeEntry>, DerivflowError> {
        Ok(self
            .indexes
            .get(&(run.clone(), node_id.to_string()))
            .and_then(|index| index.get(subject).cloned()))
    }
}
