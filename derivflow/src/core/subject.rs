//! Subject identity.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use crate::utils::{canonical_path_string, file_stem_string};

/// Property key holding the derived subject label.
pub const SUBJECT_NAME_PROPERTY: &str = "subject_name";

static BIDS_SUBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sub-([^_]+)").expect("valid subject pattern"));

/// Canonical, absolute, `/`-separated path of one workflow input file.
///
/// Construct through [`SubjectPath::new`] so that every spelling of a file
/// maps onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectPath(String);

impl SubjectPath {
    /// Canonicalizes `path` into a subject identity.
    ///
    /// # Errors
    ///
    /// Returns an error if a relative path cannot be made absolute.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        canonical_path_string(path).map(Self)
    }

    /// Returns the canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the canonical path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// File name without its last extension; names the subject's derivative directory.
    #[must_use]
    pub fn stem(&self) -> String {
        file_stem_string(self.as_path())
    }

    /// Subject label derived from a BIDS-style name (`sub-<label>_...`).
    ///
    /// Falls back to the file stem for names that do not follow the convention.
    #[must_use]
    pub fn label(&self) -> String {
        let name = self
            .as_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        BIDS_SUBJECT
            .captures(&name)
            .and_then(|c| c.get(1))
            .map_or_else(|| self.stem(), |m| m.as_str().to_string())
    }
}

impl fmt::Display for SubjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for SubjectPath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl Borrow<str> for SubjectPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}
