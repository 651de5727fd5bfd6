//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::DerivflowError;

/// Environment variable overriding [`EngineConfig::workspace_dir`].
pub const WORKSPACE_ENV_VAR: &str = "DERIVFLOW_WORKSPACE";

/// Configuration of the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where run manifests and resume indexes are kept.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Skip flag used when a node's parameters omit `skip_analyzed`.
    #[serde(default = "default_skip_analyzed")]
    pub skip_analyzed_default: bool,
    /// Subjects processed concurrently within a node; 1 is sequential.
    #[serde(default = "default_max_concurrent_subjects")]
    pub max_concurrent_subjects: usize,
    /// Trailing causes kept in a failure message.
    #[serde(default = "default_failure_trace_depth")]
    pub failure_trace_depth: usize,
    /// Record and check SHA-256 digests of output files.
    #[serde(default)]
    pub verify_content_digests: bool,
    /// Write `dataset_description.json` after a node succeeds.
    #[serde(default = "default_write_dataset_description")]
    pub write_dataset_description: bool,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("derivflow-workspace")
}

fn default_skip_analyzed() -> bool {
    false
}

fn default_max_concurrent_subjects() -> usize {
    1
}

fn default_failure_trace_depth() -> usize {
    2
}

fn default_write_dataset_description() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            skip_analyzed_default: default_skip_analyzed(),
            max_concurrent_subjects: default_max_concurrent_subjects(),
            failure_trace_depth: default_failure_trace_depth(),
            verify_content_digests: false,
            write_dataset_description: default_write_dataset_description(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a YAML or JSON file, chosen by extension,
    /// then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DerivflowError> {
        let config: Self = load_document(path.as_ref())?;
        Ok(config.with_env_overrides())
    }

    /// Applies `DERIVFLOW_WORKSPACE` if set.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(WORKSPACE_ENV_VAR).filter(|v| !v.is_empty()) {
            self.workspace_dir = PathBuf::from(dir);
        }
        self
    }

    /// Sets the workspace directory.
    #[must_use]
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    /// Sets the default skip flag.
    #[must_use]
    pub fn with_skip_analyzed_default(mut self, skip: bool) -> Self {
        self.skip_analyzed_default = skip;
        self
    }

    /// Sets the subject concurrency; values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_concurrent_subjects(mut self, n: usize) -> Self {
        self.max_concurrent_subjects = n.max(1);
        self
    }

    /// Sets the number of retained failure causes.
    #[must_use]
    pub fn with_failure_trace_depth(mut self, depth: usize) -> Self {
        self.failure_trace_depth = depth;
        self
    }

    /// Enables or disables content digests.
    #[must_use]
    pub fn with_content_digests(mut self, enabled: bool) -> Self {
        self.verify_content_digests = enabled;
        self
    }

    /// Enables or disables dataset descriptions.
    #[must_use]
    pub fn with_dataset_description(mut self, enabled: bool) -> Self {
        self.write_dataset_description = enabled;
        self
    }
}

/// Reads a YAML (`.yaml`/`.yml`) or JSON document.
pub(crate) fn load_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DerivflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.skip_analyzed_default);
        assert_eq!(config.max_concurrent_subjects, 1);
        assert_eq!(config.failure_trace_depth, 2);
        assert!(!config.verify_content_digests);
        assert!(config.write_dataset_description);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_workspace_dir("/tmp/ws")
            .with_max_concurrent_subjects(0)
            .with_content_digests(true);
        assert_eq!(config.workspace_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(config.max_concurrent_subjects, 1);
        assert!(config.verify_content_digests);
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("engine.yaml");
        std::fs::write(&yaml, "skip_analyzed_default: true\nmax_concurrent_subjects: 4\n").unwrap();
        let config: EngineConfig = load_document(&yaml).unwrap();
        assert!(config.skip_analyzed_default);
        assert_eq!(config.max_concurrent_subjects, 4);
        assert_eq!(config.failure_trace_depth, 2);

        let json = dir.path().join("engine.json");
        std::fs::write(&json, r#"{"failure_trace_depth": 5}"#).unwrap();
        let config: EngineConfig = load_document(&json).unwrap();
        assert_eq!(config.failure_trace_depth, 5);
        assert!(config.write_dataset_description);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(DerivflowError::Serialization(_))
        ));
    }
}
