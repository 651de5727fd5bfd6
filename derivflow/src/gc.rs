//! Derivative GC: removes subject directories a node no longer produces.
//!
//! Before a node runs, every existing subject directory under the node's
//! derivative root is marked unused. Each directory the run confirms, by
//! computing or by skipping, is taken off that set and is never put back.
//! After the node succeeds the remaining directories are deleted.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::store::artifact::remove_dir_below;
use crate::store::ArtifactStore;
use crate::utils::canonical_path;

/// Unused-directory tracking for one node execution.
#[derive(Debug)]
pub struct DerivativeGc {
    node_dir: PathBuf,
    unused: Mutex<BTreeSet<PathBuf>>,
}

impl DerivativeGc {
    /// Marks every existing subdirectory of `node_dir` as unused.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn scan(node_dir: impl AsRef<Path>) -> io::Result<Self> {
        let node_dir = canonical_path(node_dir)?;
        let unused: BTreeSet<PathBuf> = ArtifactStore::list_subdirs(&node_dir)?.into_iter().collect();
        debug!(node_dir = %node_dir.display(), existing = unused.len(), "Scanned derivatives");
        Ok(Self {
            node_dir,
            unused: Mutex::new(unused),
        })
    }

    /// The node's derivative root.
    #[must_use]
    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    /// Confirms a directory as used by the current run.
    pub fn confirm(&self, dir: impl AsRef<Path>) {
        let dir = canonical_path(dir.as_ref()).unwrap_or_else(|_| dir.as_ref().to_path_buf());
        self.unused.lock().remove(&dir);
    }

    /// Directories still marked unused.
    #[must_use]
    pub fn unused(&self) -> Vec<PathBuf> {
        self.unused.lock().iter().cloned().collect()
    }

    /// Deletes every directory still marked unused and returns them.
    ///
    /// The node root itself is never deleted. A directory that cannot be
    /// removed is logged and left in place.
    #[must_use = "the removed directories should be reported"]
    pub fn sweep(self) -> Vec<PathBuf> {
        let unused = self.unused.into_inner();
        let mut removed = Vec::with_capacity(unused.len());
        for dir in unused {
            match remove_dir_below(&dir, &self.node_dir) {
                Ok(()) => removed.push(dir),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove stale derivatives"),
            }
        }
        if !removed.is_empty() {
            info!(node_dir = %self.node_dir.display(), removed = removed.len(), "Removed stale derivatives");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_dir_with(subjects: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for s in subjects {
            std::fs::create_dir_all(dir.path().join(s)).unwrap();
            std::fs::write(dir.path().join(s).join("out.nii"), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn test_sweep_removes_only_unconfirmed() {
        let dir = node_dir_with(&["sub-01", "sub-02", "sub-03"]);
        let gc = DerivativeGc::scan(dir.path()).unwrap();
        assert_eq!(gc.unused().len(), 3);

        gc.confirm(dir.path().join("sub-01"));
        gc.confirm(dir.path().join(".").join("sub-03"));

        let removed = gc.sweep();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("sub-02"));
        assert!(dir.path().join("sub-01").exists());
        assert!(!dir.path().join("sub-02").exists());
        assert!(dir.path().join("sub-03").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_confirmed_directory_stays_confirmed() {
        let dir = node_dir_with(&["sub-01", "sub-02"]);
        let gc = DerivativeGc::scan(dir.path()).unwrap();

        gc.confirm(dir.path().join("sub-01"));
        // A later failure for sub-01 never re-marks it; there is no way back.
        gc.confirm(dir.path().join("sub-01"));
        assert_eq!(gc.unused(), vec![canonical_path(dir.path().join("sub-02")).unwrap()]);

        let _ = gc.sweep();
        assert!(dir.path().join("sub-01").exists());
    }

    #[test]
    fn test_missing_node_dir() {
        let dir = tempfile::tempdir().unwrap();
        let gc = DerivativeGc::scan(dir.path().join("absent")).unwrap();
        assert!(gc.unused().is_empty());
        assert!(gc.sweep().is_empty());
    }

    #[test]
    fn test_files_are_not_collected() {
        let dir = node_dir_with(&["sub-01"]);
        std::fs::write(dir.path().join("dataset_description.json"), b"{}").unwrap();
        let gc = DerivativeGc::scan(dir.path()).unwrap();
        let removed = gc.sweep();
        assert_eq!(removed.len(), 1);
        assert!(dir.path().join("dataset_description.json").exists());
    }
}
