//! The analysis ledger: one record per subject for the node being executed.
//!
//! A ledger is created from the raw subject list for a root node, or derived
//! from the upstream node's ledger so that groups and properties travel down
//! the pipeline. Every subject argument accepts any spelling of the path; it
//! is canonicalized before lookup.

mod grouping;

pub use grouping::{
    contrast_pair_name, groups_from_filemap, load_filemap, parse_contrast_pair, FactorFolder,
    FactorImage, FILEMAP_FILE_NAME,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::core::{AnalysisRecord, AnalysisStatus, NodeKind, SubjectPath};
use crate::errors::DerivflowError;
use crate::utils::{canonical_path_strings, now_local};

/// Per-subject records of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LedgerDocument", into = "LedgerDocument")]
pub struct AnalysisLedger {
    node_kind: NodeKind,
    records: Vec<AnalysisRecord>,
    index: HashMap<SubjectPath, usize>,
}

/// Serialized form of a ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerDocument {
    node_kind: NodeKind,
    records: Vec<AnalysisRecord>,
}

impl TryFrom<LedgerDocument> for AnalysisLedger {
    type Error = DerivflowError;

    fn try_from(doc: LedgerDocument) -> Result<Self, Self::Error> {
        let mut index = HashMap::with_capacity(doc.records.len());
        for (i, record) in doc.records.iter().enumerate() {
            if index.insert(record.subject_path.clone(), i).is_some() {
                return Err(DerivflowError::Serialization(format!(
                    "duplicate subject in ledger: {}",
                    record.subject_path
                )));
            }
        }
        Ok(Self {
            node_kind: doc.node_kind,
            records: doc.records,
            index,
        })
    }
}

impl From<AnalysisLedger> for LedgerDocument {
    fn from(ledger: AnalysisLedger) -> Self {
        Self {
            node_kind: ledger.node_kind,
            records: ledger.records,
        }
    }
}

impl AnalysisLedger {
    /// Builds one waiting record per subject.
    ///
    /// Subjects are canonicalized and de-duplicated in discovery order. Group
    /// assignments naming a subject outside the declared set are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a path cannot be canonicalized, or
    /// `DuplicateSubjectStem` if two distinct subjects share a file stem.
    pub fn create<I, P, G, Q>(subjects: I, groups: G, node_kind: NodeKind) -> Result<Self, DerivflowError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        G: IntoIterator<Item = (Q, Vec<String>)>,
        Q: AsRef<Path>,
    {
        let mut records: Vec<AnalysisRecord> = Vec::new();
        let mut index = HashMap::new();
        let mut stems: HashMap<String, usize> = HashMap::new();
        for path in subjects {
            let subject = SubjectPath::new(path)?;
            if index.contains_key(&subject) {
                continue;
            }
            // The stem names the derivative directory.
            if let Some(&i) = stems.get(&subject.stem()) {
                return Err(DerivflowError::DuplicateSubjectStem {
                    stem: subject.stem(),
                    first: records[i].subject_path.to_string(),
                    second: subject.to_string(),
                });
            }
            stems.insert(subject.stem(), records.len());
            index.insert(subject.clone(), records.len());
            records.push(AnalysisRecord::new(subject, None));
        }

        for (path, group) in groups {
            let subject = SubjectPath::new(path)?;
            match index.get(&subject) {
                Some(&i) => records[i].group = Some(group),
                None => warn!(subject = %subject, "Dropping group for undeclared subject"),
            }
        }

        Ok(Self {
            node_kind,
            records,
            index,
        })
    }

    /// Returns a ledger over the same subjects, groups and properties with fresh waiting records.
    #[must_use]
    pub fn derive(&self, node_kind: NodeKind) -> Self {
        Self {
            node_kind,
            records: self.records.iter().map(AnalysisRecord::derive).collect(),
            index: self.index.clone(),
        }
    }

    /// The kind of node this ledger belongs to.
    #[must_use]
    pub fn node_kind(&self) -> &NodeKind {
        &self.node_kind
    }

    /// Number of subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the ledger has no subjects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Subjects in discovery order.
    pub fn subjects(&self) -> impl Iterator<Item = &SubjectPath> {
        self.records.iter().map(|r| &r.subject_path)
    }

    /// Records in discovery order.
    #[must_use]
    pub fn records(&self) -> &[AnalysisRecord] {
        &self.records
    }

    /// Returns true if `subject` is part of this ledger.
    pub fn contains(&self, subject: impl AsRef<Path>) -> bool {
        self.position(subject).is_ok()
    }

    /// Resolves any spelling of a subject to its canonical identity.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn resolve(&self, subject: impl AsRef<Path>) -> Result<&SubjectPath, DerivflowError> {
        self.position(subject).map(|i| &self.records[i].subject_path)
    }

    /// Returns the record of a subject.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn record(&self, subject: impl AsRef<Path>) -> Result<&AnalysisRecord, DerivflowError> {
        self.position(subject).map(|i| &self.records[i])
    }

    /// Moves a subject to a new status.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject`, or `InvalidTransition` if the move would go backwards.
    pub fn set_status(
        &mut self,
        subject: impl AsRef<Path>,
        status: AnalysisStatus,
    ) -> Result<(), DerivflowError> {
        let record = self.record_mut(subject)?;
        if !record.status.can_transition_to(status) {
            return Err(DerivflowError::InvalidTransition {
                subject: record.subject_path.to_string(),
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        Ok(())
    }

    /// Replaces a subject's output paths; each path is canonicalized.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` or an error if a path cannot be canonicalized.
    pub fn set_output_paths<I, P>(
        &mut self,
        subject: impl AsRef<Path>,
        paths: I,
    ) -> Result<(), DerivflowError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let paths = canonical_path_strings(paths)?;
        self.record_mut(subject)?.output_paths = paths;
        Ok(())
    }

    /// Sets a subject's diagnostic message.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn set_message(
        &mut self,
        subject: impl AsRef<Path>,
        message: impl Into<String>,
    ) -> Result<(), DerivflowError> {
        self.record_mut(subject)?.message = message.into();
        Ok(())
    }

    /// Sets an auxiliary property.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn set_property(
        &mut self,
        subject: impl AsRef<Path>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), DerivflowError> {
        self.record_mut(subject)?.properties.insert(key.into(), value);
        Ok(())
    }

    /// Stamps the subject's start time.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn mark_start(&mut self, subject: impl AsRef<Path>) -> Result<(), DerivflowError> {
        self.record_mut(subject)?.start_time = Some(now_local());
        Ok(())
    }

    /// Stamps the subject's end time.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSubject` if the subject is not part of the ledger.
    pub fn mark_end(&mut self, subject: impl AsRef<Path>) -> Result<(), DerivflowError> {
        self.record_mut(subject)?.end_time = Some(now_local());
        Ok(())
    }

    /// Node-level status: `Error` iff every subject failed here or upstream, else `Processed`.
    ///
    /// An empty ledger has nothing usable and aggregates to `Error`.
    #[must_use]
    pub fn aggregate_status(&self) -> AnalysisStatus {
        if self.records.iter().all(|r| r.status.is_failure()) {
            AnalysisStatus::Error
        } else {
            AnalysisStatus::Processed
        }
    }

    /// Node-level status message, `error` or `success`.
    #[must_use]
    pub fn status_message(&self) -> &'static str {
        if self.aggregate_status() == AnalysisStatus::Error {
            "error"
        } else {
            "success"
        }
    }

    /// Number of subjects that failed here or upstream.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.records.iter().filter(|r| r.status.is_failure()).count()
    }

    /// Partitions subjects by a key, keeping discovery order of partitions and
    /// of subjects within each partition.
    pub fn grouped_by<K, F>(&self, key_fn: F) -> Vec<(K, Vec<SubjectPath>)>
    where
        K: PartialEq,
        F: Fn(&AnalysisRecord) -> K,
    {
        let mut partitions: Vec<(K, Vec<SubjectPath>)> = Vec::new();
        for record in &self.records {
            let key = key_fn(record);
            match partitions.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(record.subject_path.clone()),
                None => partitions.push((key, vec![record.subject_path.clone()])),
            }
        }
        partitions
    }

    /// Partitions subjects by their group tuple.
    #[must_use]
    pub fn grouped(&self) -> Vec<(Vec<String>, Vec<SubjectPath>)> {
        self.grouped_by(AnalysisRecord::group_key)
    }

    fn position(&self, subject: impl AsRef<Path>) -> Result<usize, DerivflowError> {
        let raw = subject.as_ref();
        if let Some(&i) = raw.to_str().and_then(|s| self.index.get(s)) {
            return Ok(i);
        }
        let canonical = SubjectPath::new(raw)?;
        self.index
            .get(&canonical)
            .copied()
            .ok_or_else(|| DerivflowError::UnknownSubject(canonical.to_string()))
    }

    fn record_mut(&mut self, subject: impl AsRef<Path>) -> Result<&mut AnalysisRecord, DerivflowError> {
        let i = self.position(subject)?;
        Ok(&mut self.records[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn no_groups() -> Vec<(String, Vec<String>)> {
        Vec::new()
    }

    fn ledger(names: &[&str]) -> AnalysisLedger {
        let paths: Vec<String> = names.iter().map(|n| format!("/data/{n}")).collect();
        AnalysisLedger::create(paths, no_groups(), NodeKind::from("alignment")).unwrap()
    }

    #[test]
    fn test_create_dedupes_spellings() {
        let ledger = AnalysisLedger::create(
            ["/data/sub-01.nii", "/data/./sub-01.nii", "/data/x/../sub-02.nii"],
            no_groups(),
            NodeKind::from("alignment"),
        )
        .unwrap();

        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("/data/sub-02.nii"));
        assert!(ledger.records().iter().all(|r| r.status == AnalysisStatus::Waiting));
    }

    #[test]
    fn test_create_rejects_shared_stem() {
        let err = AnalysisLedger::create(
            ["/data/a/sub-01_T1w.nii", "/data/b/sub-01_T1w.nii"],
            no_groups(),
            NodeKind::from("alignment"),
        )
        .unwrap_err();

        match err {
            DerivflowError::DuplicateSubjectStem { stem, first, second } => {
                assert_eq!(stem, "sub-01_T1w");
                assert_eq!(first, "/data/a/sub-01_T1w.nii");
                assert_eq!(second, "/data/b/sub-01_T1w.nii");
            }
            other => panic!("expected stem collision, got {other}"),
        }

        // Same file spelled twice is still one subject.
        let ledger = AnalysisLedger::create(
            ["/data/a/sub-01_T1w.nii", "/data/b/../a/sub-01_T1w.nii"],
            no_groups(),
            NodeKind::from("alignment"),
        )
        .unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_create_drops_undeclared_groups() {
        let ledger = AnalysisLedger::create(
            ["/data/sub-01.nii"],
            vec![
                ("/data/sub-01.nii", vec!["patients".to_string()]),
                ("/data/sub-99.nii", vec!["controls".to_string()]),
            ],
            NodeKind::from("alignment"),
        )
        .unwrap();

        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.record("/data/sub-01.nii").unwrap().group,
            Some(vec!["patients".to_string()])
        );
        assert!(!ledger.contains("/data/sub-99.nii"));
    }

    #[test]
    fn test_unknown_subject() {
        let mut ledger = ledger(&["sub-01.nii"]);
        let err = ledger
            .set_status("/data/sub-02.nii", AnalysisStatus::Processing)
            .unwrap_err();
        assert!(matches!(err, DerivflowError::UnknownSubject(_)));
        assert!(matches!(
            ledger.mark_start("/elsewhere/sub-01.nii"),
            Err(DerivflowError::UnknownSubject(_))
        ));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut ledger = ledger(&["sub-01.nii"]);
        let s = "/data/sub-01.nii";
        ledger.set_status(s, AnalysisStatus::Processing).unwrap();
        ledger.set_status(s, AnalysisStatus::Processed).unwrap();

        let err = ledger.set_status(s, AnalysisStatus::Error).unwrap_err();
        assert!(matches!(
            err,
            DerivflowError::InvalidTransition { from: AnalysisStatus::Processed, .. }
        ));
        assert_eq!(ledger.record(s).unwrap().status, AnalysisStatus::Processed);
    }

    #[test]
    fn test_setters_accept_any_spelling() {
        let mut ledger = ledger(&["sub-01.nii"]);
        ledger.set_message("/data/nested/../sub-01.nii", "hello").unwrap();
        ledger.mark_start("/data/./sub-01.nii").unwrap();
        ledger.mark_end("/data/sub-01.nii").unwrap();
        ledger
            .set_output_paths("/data/sub-01.nii", ["/out/./a.nii", "/out/b.nii"])
            .unwrap();

        let record = ledger.record("/data/sub-01.nii").unwrap();
        assert_eq!(record.message, "hello");
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_some());
        assert_eq!(record.output_paths, vec!["/out/a.nii", "/out/b.nii"]);
    }

    #[test]
    fn test_aggregate_partial_success() {
        let mut ledger = ledger(&["a.nii", "b.nii", "c.nii"]);
        ledger.set_status("/data/a.nii", AnalysisStatus::Error).unwrap();
        ledger.set_status("/data/b.nii", AnalysisStatus::PreviousError).unwrap();
        assert_eq!(ledger.aggregate_status(), AnalysisStatus::Processed);
        assert_eq!(ledger.status_message(), "success");

        ledger.set_status("/data/c.nii", AnalysisStatus::Error).unwrap();
        assert_eq!(ledger.aggregate_status(), AnalysisStatus::Error);
        assert_eq!(ledger.status_message(), "error");
        assert_eq!(ledger.failed_count(), 3);
    }

    #[test]
    fn test_aggregate_single_success_wins() {
        let mut ledger = ledger(&["a.nii", "b.nii"]);
        ledger.set_status("/data/a.nii", AnalysisStatus::Error).unwrap();
        ledger.set_status("/data/b.nii", AnalysisStatus::Skipped).unwrap();
        assert_eq!(ledger.aggregate_status(), AnalysisStatus::Processed);
    }

    #[test]
    fn test_empty_ledger_aggregates_to_error() {
        let ledger = ledger(&[]);
        assert!(ledger.is_empty());
        assert_eq!(ledger.aggregate_status(), AnalysisStatus::Error);
    }

    #[test]
    fn test_derive_resets_records() {
        let mut upstream = AnalysisLedger::create(
            ["/data/sub-01.nii"],
            vec![("/data/sub-01.nii", vec!["g1".to_string()])],
            NodeKind::from("alignment"),
        )
        .unwrap();
        upstream
            .set_property("/data/sub-01.nii", "subject_name", json!("01"))
            .unwrap();
        upstream.set_status("/data/sub-01.nii", AnalysisStatus::Error).unwrap();
        upstream.set_message("/data/sub-01.nii", "boom").unwrap();

        let derived = upstream.derive(NodeKind::from("segment1"));
        let record = derived.record("/data/sub-01.nii").unwrap();

        assert_eq!(derived.node_kind().as_str(), "segment1");
        assert_eq!(record.status, AnalysisStatus::Waiting);
        assert_eq!(record.group, Some(vec!["g1".to_string()]));
        assert_eq!(record.property_str("subject_name"), Some("01"));
        assert!(record.message.is_empty());
        assert_eq!(upstream.record("/data/sub-01.nii").unwrap().status, AnalysisStatus::Error);
    }

    #[test]
    fn test_grouped_preserves_order() {
        let ledger = AnalysisLedger::create(
            ["/d/a.nii", "/d/b.nii", "/d/c.nii", "/d/e.nii"],
            vec![
                ("/d/a.nii", vec!["patients".to_string(), "pre".to_string()]),
                ("/d/b.nii", vec!["controls".to_string(), "pre".to_string()]),
                ("/d/c.nii", vec!["patients".to_string(), "pre".to_string()]),
            ],
            NodeKind::from("smoothing"),
        )
        .unwrap();

        let groups = ledger.grouped();
        let keys: Vec<_> = groups.iter().map(|(k, _)| k.join("/")).collect();
        assert_eq!(keys, vec!["patients/pre", "controls/pre", ""]);
        let patients: Vec<_> = groups[0].1.iter().map(SubjectPath::stem).collect();
        assert_eq!(patients, vec!["a", "c"]);
    }

    #[test]
    fn test_grouped_by_custom_key() {
        let ledger = AnalysisLedger::create(
            ["/d/a.nii", "/d/b.nii"],
            vec![
                ("/d/a.nii", vec!["patients".to_string(), "pre".to_string()]),
                ("/d/b.nii", vec!["patients".to_string(), "post".to_string()]),
            ],
            NodeKind::from("smoothing"),
        )
        .unwrap();

        let by_between = ledger.grouped_by(|r| r.group_key().first().cloned());
        assert_eq!(by_between.len(), 1);
        assert_eq!(by_between[0].1.len(), 2);
    }

    #[test]
    fn test_ledger_serde_roundtrip() {
        let mut ledger = ledger(&["a.nii", "b.nii"]);
        ledger.set_status("/data/a.nii", AnalysisStatus::Processing).unwrap();
        ledger.set_output_paths("/data/a.nii", ["/out/a.nii"]).unwrap();

        let json = serde_json::to_string(&ledger).unwrap();
        let back: AnalysisLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
        assert!(back.contains("/data/b.nii"));
    }

    #[test]
    fn test_ledger_rejects_duplicate_records() {
        let doc = json!({
            "node_kind": "alignment",
            "records": [
                {"subject_path": "/d/a.nii", "status": "waiting"},
                {"subject_path": "/d/a.nii", "status": "waiting"}
            ]
        });
        assert!(serde_json::from_value::<AnalysisLedger>(doc).is_err());
    }
}
