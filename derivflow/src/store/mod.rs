//! Durable state: run manifests, resume indexes and derivative files.
//!
//! Manifests and resume indexes sit behind async store traits with a
//! JSON-file backend and an in-memory backend. Derivatives are plain
//! directories managed by [`ArtifactStore`].

pub mod artifact;
pub mod manifest;
pub mod resume;

pub use artifact::{
    file_digest, ArtifactStore, DatasetDescription, GeneratedBy,
    DATASET_DESCRIPTION_FILE_NAME, DERIVATIVES_DIR_NAME,
};
pub use manifest::{
    GraphEdge, GraphNode, InMemoryManifestStore, JsonFileManifestStore, ManifestStore,
    NodeOutcome, RunGraph, RunManifest, SubjectOutcome, MANIFEST_FILE_NAME,
};
pub use resume::{
    InMemoryResumeStore, JsonFileResumeStore, ResumeEntry, ResumeIndex, ResumeStore,
    RESUME_DIR_NAME,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::DerivflowError;

/// Identifies one run of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    /// Project the run belongs to.
    pub project_id: String,
    /// Run id.
    pub run_id: String,
}

impl RunKey {
    /// Creates a run key.
    #[must_use]
    pub fn new(project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Directory holding this run's documents below a workspace root.
    #[must_use]
    pub fn dir_in(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.project_id).join(&self.run_id)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.run_id)
    }
}

/// Serializes `value` to `path` through a temporary sibling and a rename,
/// so readers never observe a partially written document.
pub(crate) async fn write_json_atomic<T: Serialize + Sync>(
    path: &Path,
    value: &T,
) -> Result<(), DerivflowError> {
    let json = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(DerivflowError::persistence)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json)
        .await
        .map_err(DerivflowError::persistence)?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(DerivflowError::persistence)
}

/// Reads a JSON document, returning `None` if it does not exist.
pub(crate) async fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, DerivflowError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DerivflowError::persistence(e)),
    }
}
