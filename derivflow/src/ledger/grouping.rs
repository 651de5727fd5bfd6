//! Group assignment from a project file map and contrast pair naming.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::errors::DerivflowError;
use crate::utils::canonical_path_string;

/// File name of the project file map.
pub const FILEMAP_FILE_NAME: &str = "filemap.json";

static CONTRAST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.*?)>").expect("valid contrast pattern"));

/// A factor folder in the project file map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorFolder {
    /// Factor name.
    pub folder_name: String,
    /// Images filed directly under this factor.
    #[serde(default)]
    pub images: Vec<FactorImage>,
    /// Nested factor folders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_folders: Option<Vec<FactorFolder>>,
}

/// An image entry in the project file map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorImage {
    /// Path relative to the project root.
    pub path: String,
}

/// Reads `filemap.json` from a project root.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_filemap(project_root: impl AsRef<Path>) -> Result<Vec<FactorFolder>, DerivflowError> {
    let path = project_root.as_ref().join(FILEMAP_FILE_NAME);
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Maps each subject to its `[between]` or `[between, within]` factor names.
///
/// Image paths in the file map are relative to `project_root`. Subjects
/// that appear nowhere in the map get no entry. Returned keys are canonical
/// subject paths.
///
/// # Errors
///
/// Returns an error if a path cannot be canonicalized.
pub fn groups_from_filemap<I, P>(
    project_root: impl AsRef<Path>,
    filemap: &[FactorFolder],
    subjects: I,
) -> Result<BTreeMap<String, Vec<String>>, DerivflowError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let root = project_root.as_ref();

    let mut by_image = BTreeMap::new();
    collect_factors(root, filemap, None, &mut by_image)?;

    let mut groups = BTreeMap::new();
    for subject in subjects {
        let key = canonical_path_string(subject)?;
        if let Some(factors) = by_image.get(&key) {
            groups.insert(key, factors.clone());
        }
    }
    Ok(groups)
}

fn collect_factors(
    root: &Path,
    folders: &[FactorFolder],
    parent: Option<&str>,
    out: &mut BTreeMap<String, Vec<String>>,
) -> Result<(), DerivflowError> {
    for folder in folders {
        for image in &folder.images {
            let key = canonical_path_string(root.join(&image.path))?;
            let factors = match parent {
                Some(p) => vec![p.to_string(), folder.folder_name.clone()],
                None => vec![folder.folder_name.clone()],
            };
            // First hit wins, in file map order.
            out.entry(key).or_insert(factors);
        }
        if let Some(subs) = &folder.sub_folders {
            collect_factors(root, subs, Some(&folder.folder_name), out)?;
        }
    }
    Ok(())
}

/// Renders a contrast pair as `<A><X>-<B><X>`.
#[must_use]
pub fn contrast_pair_name(first: &[String], second: &[String]) -> String {
    let wrap = |side: &[String]| side.iter().map(|f| format!("<{f}>")).collect::<String>();
    format!("{}-{}", wrap(first), wrap(second))
}

/// Parses a contrast pair name back into its two factor tuples.
///
/// Accepts two tokens (between factors only) or four (between and within);
/// anything else yields `None`.
#[must_use]
pub fn parse_contrast_pair(name: &str) -> Option<(Vec<String>, Vec<String>)> {
    let tokens: Vec<String> = CONTRAST_TOKEN
        .captures_iter(name)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    match tokens.len() {
        2 | 4 => {
            let half = tokens.len() / 2;
            let second = tokens[half..].to_vec();
            let mut first = tokens;
            first.truncate(half);
            Some((first, second))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_contrast_pair_name() {
        assert_eq!(
            contrast_pair_name(&s(&["patients", "pre"]), &s(&["controls", "pre"])),
            "<patients><pre>-<controls><pre>"
        );
        assert_eq!(contrast_pair_name(&s(&["a"]), &s(&["b"])), "<a>-<b>");
    }

    #[test]
    fn test_parse_contrast_pair() {
        assert_eq!(
            parse_contrast_pair("<patients><pre>-<controls><pre>"),
            Some((s(&["patients", "pre"]), s(&["controls", "pre"])))
        );
        assert_eq!(
            parse_contrast_pair("<patients>-<controls>"),
            Some((s(&["patients"]), s(&["controls"])))
        );
        assert_eq!(parse_contrast_pair("<a><b><c>"), None);
        assert_eq!(parse_contrast_pair("plain"), None);
    }

    #[test]
    fn test_groups_from_filemap() {
        let dir = tempfile::tempdir().unwrap();
        let filemap: Vec<FactorFolder> = serde_json::from_value(json!([
            {
                "folder_name": "patients",
                "images": [{"path": "raw/sub-01.nii"}],
                "sub_folders": [
                    {"folder_name": "pre", "images": [{"path": "raw/sub-02.nii"}]}
                ]
            },
            {"folder_name": "controls", "images": [{"path": "raw/sub-03.nii"}]}
        ]))
        .unwrap();
        std::fs::write(
            dir.path().join(FILEMAP_FILE_NAME),
            serde_json::to_string(&filemap).unwrap(),
        )
        .unwrap();

        let loaded = load_filemap(dir.path()).unwrap();
        assert_eq!(loaded, filemap);

        let subjects: Vec<_> = ["sub-01.nii", "sub-02.nii", "sub-03.nii", "sub-04.nii"]
            .iter()
            .map(|n| dir.path().join("raw").join(n))
            .collect();
        let groups = groups_from_filemap(dir.path(), &loaded, &subjects).unwrap();

        let key = |i: usize| canonical_path_string(&subjects[i]).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[&key(0)], s(&["patients"]));
        assert_eq!(groups[&key(1)], s(&["patients", "pre"]));
        assert_eq!(groups[&key(2)], s(&["controls"]));
        assert!(!groups.contains_key(&key(3)));
    }
}
