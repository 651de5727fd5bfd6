//! Per-subject analysis record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AnalysisStatus, SubjectPath};
use crate::utils::timestamps::{optional_timestamp, Timestamp};

/// What one node execution did for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Canonical subject identity.
    pub subject_path: SubjectPath,

    /// Hierarchical classification, e.g. `["cohort-A", "visit-1"]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Vec<String>>,

    /// Current status.
    pub status: AnalysisStatus,

    /// Set when the node function is invoked.
    #[serde(default, with = "optional_timestamp")]
    pub start_time: Option<Timestamp>,

    /// Set when the subject is done, on success and failure alike.
    #[serde(default, with = "optional_timestamp")]
    pub end_time: Option<Timestamp>,

    /// Artifacts produced for this subject, in production order.
    #[serde(default)]
    pub output_paths: Vec<String>,

    /// Free-text diagnostic.
    #[serde(default)]
    pub message: String,

    /// Auxiliary values carried into derived records.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl AnalysisRecord {
    /// Creates a waiting record.
    #[must_use]
    pub fn new(subject_path: SubjectPath, group: Option<Vec<String>>) -> Self {
        Self {
            subject_path,
            group,
            status: AnalysisStatus::Waiting,
            start_time: None,
            end_time: None,
            output_paths: Vec::new(),
            message: String::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Creates a fresh waiting record keeping this record's identity, group and properties.
    #[must_use]
    pub fn derive(&self) -> Self {
        let mut record = Self::new(self.subject_path.clone(), self.group.clone());
        record.properties = self.properties.clone();
        record
    }

    /// Group tuple used as a partition key; ungrouped subjects share the empty key.
    #[must_use]
    pub fn group_key(&self) -> Vec<String> {
        self.group.clone().unwrap_or_default()
    }

    /// Returns a string property.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(serde_json::Value::as_str)
    }

    /// Subject label: the `subject_name` property, else the label derived from the path.
    #[must_use]
    pub fn label(&self) -> String {
        self.property_str(super::subject::SUBJECT_NAME_PROPERTY)
            .map_or_else(|| self.subject_path.label(), ToString::to_string)
    }
}
