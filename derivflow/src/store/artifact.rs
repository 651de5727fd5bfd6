//! Path-addressed derivative storage.
//!
//! Layout below a project root:
//!
//! ```text
//! <project_root>/derivatives/<run_id>/<node_id>/<subject stem>/...
//! <project_root>/derivatives/<run_id>/<node_id>/dataset_description.json
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::core::SubjectPath;
use crate::utils::{canonical_path, paths::is_strictly_within};

/// Name of the directory holding all derivatives of a project.
pub const DERIVATIVES_DIR_NAME: &str = "derivatives";

/// Name of the per-node dataset description document.
pub const DATASET_DESCRIPTION_FILE_NAME: &str = "dataset_description.json";

const GENERATOR_NAME: &str = "derivflow";

/// Derivative directories of one project.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    project_root: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at a project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be made absolute.
    pub fn new(project_root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            project_root: canonical_path(project_root)?,
        })
    }

    /// The project root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Directory holding every node's derivatives for a run.
    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.project_root.join(DERIVATIVES_DIR_NAME).join(run_id)
    }

    /// Directory holding one node's derivatives.
    #[must_use]
    pub fn node_dir(&self, run_id: &str, node_id: &str) -> PathBuf {
        self.run_dir(run_id).join(node_id)
    }

    /// Directory holding one subject's derivatives for one node.
    #[must_use]
    pub fn subject_dir(&self, run_id: &str, node_id: &str, subject: &SubjectPath) -> PathBuf {
        self.node_dir(run_id, node_id).join(subject.stem())
    }

    /// Creates a subject's derivative directory if needed and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_subject_dir(
        &self,
        run_id: &str,
        node_id: &str,
        subject: &SubjectPath,
    ) -> io::Result<PathBuf> {
        let dir = self.subject_dir(run_id, node_id, subject);
        std::fs::create_dir_all(&dir)?;
        canonical_path(dir)
    }

    /// Returns true if a directory exists and contains at least one entry.
    #[must_use]
    pub fn has_derivatives(dir: &Path) -> bool {
        std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
    }

    /// Lists the immediate subdirectories of `dir`, canonicalized and sorted.
    ///
    /// A missing directory has no subdirectories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub fn list_subdirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(canonical_path(entry.path())?);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Removes a subject's stale output before recomputation.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn clear_subject_dir(
        &self,
        run_id: &str,
        node_id: &str,
        subject: &SubjectPath,
    ) -> io::Result<()> {
        let dir = self.subject_dir(run_id, node_id, subject);
        remove_dir_below(&dir, &self.node_dir(run_id, node_id))
    }

    /// Writes the dataset description of a node's derivatives.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn write_dataset_description(
        &self,
        run_id: &str,
        node_id: &str,
        description: &DatasetDescription,
    ) -> io::Result<PathBuf> {
        let dir = self.node_dir(run_id, node_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(DATASET_DESCRIPTION_FILE_NAME);
        let json = serde_json::to_vec_pretty(description).map_err(io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// Recursively removes `dir` if it lies strictly below `root`.
///
/// Missing directories are ignored; `root` itself is never removed.
pub(crate) fn remove_dir_below(dir: &Path, root: &Path) -> io::Result<()> {
    let dir = canonical_path(dir)?;
    let root = canonical_path(root)?;
    if !is_strictly_within(&dir, &root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to remove {} outside {}", dir.display(), root.display()),
        ));
    }
    match std::fs::remove_dir_all(&dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// SHA-256 of a file's content, hex encoded.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn file_digest(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Provenance document written next to a node's derivatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatasetDescription {
    /// Human-readable node name.
    pub name: String,
    /// Format marker.
    #[serde(rename = "BIDSVersion")]
    pub bids_version: String,
    /// What produced the derivatives.
    pub generated_by: GeneratedBy,
    /// Parameters the node ran with.
    pub parameters: serde_json::Value,
}

/// Generator section of a [`DatasetDescription`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeneratedBy {
    /// Program name.
    pub program_name: String,
    /// Node kind that ran.
    pub function_name: String,
}

impl DatasetDescription {
    /// Describes the derivatives of a node.
    #[must_use]
    pub fn new(name: impl Into<String>, function_name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            bids_version: "This dataset does not follow the BIDS format.".to_string(),
            generated_by: GeneratedBy {
                program_name: GENERATOR_NAME.to_string(),
                function_name: function_name.into(),
            },
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let subject = SubjectPath::new("/data/sub-01_T1w.nii").unwrap();

        let path = store.subject_dir("r1", "align", &subject);
        assert!(path.ends_with("derivatives/r1/align/sub-01_T1w"));
        assert!(path.starts_with(store.project_root()));
    }

    #[test]
    fn test_has_derivatives_requires_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let subject = SubjectPath::new("/data/sub-01.nii").unwrap();

        let sdir = store.subject_dir("r1", "align", &subject);
        assert!(!ArtifactStore::has_derivatives(&sdir));

        store.ensure_subject_dir("r1", "align", &subject).unwrap();
        assert!(!ArtifactStore::has_derivatives(&sdir));

        std::fs::write(sdir.join("out.nii"), b"x").unwrap();
        assert!(ArtifactStore::has_derivatives(&sdir));
    }

    #[test]
    fn test_list_subdirs_skips_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();

        let dirs = ArtifactStore::list_subdirs(dir.path()).unwrap();
        let names: Vec<_> = dirs.iter().map(|d| d.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(ArtifactStore::list_subdirs(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_clear_subject_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let subject = SubjectPath::new("/data/sub-01.nii").unwrap();

        let sdir = store.ensure_subject_dir("r1", "align", &subject).unwrap();
        std::fs::write(sdir.join("stale.nii"), b"x").unwrap();

        store.clear_subject_dir("r1", "align", &subject).unwrap();
        assert!(!sdir.exists());
        assert!(store.node_dir("r1", "align").exists());
        // Clearing again is a no-op.
        store.clear_subject_dir("r1", "align", &subject).unwrap();
    }

    #[test]
    fn test_remove_refuses_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = remove_dir_below(dir.path(), dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_dataset_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let desc = DatasetDescription::new("Alignment", "alignment", json!({"skip_analyzed": true}));

        let path = store.write_dataset_description("r1", "align", &desc).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(value["Name"], json!("Alignment"));
        assert_eq!(value["GeneratedBy"]["FunctionName"], json!("alignment"));
        assert_eq!(value["Parameters"]["skip_analyzed"], json!(true));
        assert!(value.get("BIDSVersion").is_some());
    }
}
