//! Path canonicalization for subject identities and artifact paths.
//!
//! Two spellings of the same file must produce the same string, so every
//! path is made absolute, stripped of `.`/`..` segments, resolved through
//! the longest existing ancestor (following symlinks) and rendered with `/`
//! separators.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Canonicalizes a path into its POSIX-style absolute string form.
///
/// The path does not need to exist.
///
/// # Errors
///
/// Returns an error if the current directory cannot be determined for a
/// relative path.
pub fn canonical_path_string(path: impl AsRef<Path>) -> io::Result<String> {
    let resolved = resolve(path.as_ref())?;
    Ok(to_posix(&resolved))
}

/// Canonicalizes a path, returning a `PathBuf`.
///
/// # Errors
///
/// See [`canonical_path_string`].
pub fn canonical_path(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    resolve(path.as_ref())
}

/// Canonicalizes every path in a list, preserving order.
///
/// # Errors
///
/// See [`canonical_path_string`].
pub fn canonical_path_strings<I, P>(paths: I) -> io::Result<Vec<String>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    paths.into_iter().map(canonical_path_string).collect()
}

fn resolve(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let normalized = normalize_lexically(&absolute);

    // Resolve symlinks through the deepest ancestor that exists.
    let mut existing = normalized.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let mut out = real;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn to_posix(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Returns the file name of a path without its last extension.
#[must_use]
pub fn file_stem_string(path: impl AsRef<Path>) -> String {
    path.as_ref()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Returns true if `child` lies strictly below `root`.
#[must_use]
pub fn is_strictly_within(child: &Path, root: &Path) -> bool {
    child != root && child.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spellings_converge() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sub-01_T1w.nii");
        std::fs::write(&file, b"x").unwrap();

        let plain = canonical_path_string(&file).unwrap();
        let dotted = canonical_path_string(dir.path().join(".").join("sub-01_T1w.nii")).unwrap();
        let parent = canonical_path_string(
            dir.path().join("nested").join("..").join("sub-01_T1w.nii"),
        )
        .unwrap();

        assert_eq!(plain, dotted);
        assert_eq!(plain, parent);
        assert!(!plain.contains('\\'));
    }

    #[test]
    fn test_missing_path_is_still_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a").join("..").join("b").join("c.nii");
        let canonical = canonical_path(&missing).unwrap();
        assert!(canonical.is_absolute());
        assert!(canonical.ends_with("b/c.nii"));
        assert!(canonical.starts_with(std::fs::canonicalize(dir.path()).unwrap()));
    }

    #[test]
    fn test_relative_paths_become_absolute() {
        let canonical = canonical_path_string("some/relative/file.nii").unwrap();
        assert!(Path::new(&canonical).is_absolute());
        assert!(canonical.ends_with("some/relative/file.nii"));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem_string("/data/sub-01_T1w.nii"), "sub-01_T1w");
        assert_eq!(file_stem_string("/data/sub-01_T1w.nii.gz"), "sub-01_T1w.nii");
    }

    #[test]
    fn test_strictly_within() {
        let root = Path::new("/d/align");
        assert!(is_strictly_within(Path::new("/d/align/sub-01"), root));
        assert!(!is_strictly_within(root, root));
        assert!(!is_strictly_within(Path::new("/d/other"), root));
    }
}
