//! Run manifest: the full, run-scoped record of every node outcome.
//!
//! The manifest is always written whole. Updating one node replaces that
//! node's outcome and leaves every other recorded node untouched.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{read_json_opt, write_json_atomic, RunKey};
use crate::core::{AnalysisStatus, OutcomeStatus};
use crate::errors::DerivflowError;
use crate::ledger::AnalysisLedger;
use crate::utils::timestamps::{optional_timestamp, Timestamp};
use crate::utils::now_local;

/// File name of the run manifest inside a run directory.
pub const MANIFEST_FILE_NAME: &str = "experiment.json";

/// A node as declared in the run graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Node kind.
    pub kind: String,
}

/// A declared dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Upstream node id.
    pub source: String,
    /// Downstream node id.
    pub target: String,
}

/// Node ids and declared edges of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunGraph {
    /// Nodes in declaration order.
    pub nodes: Vec<GraphNode>,
    /// Edges in declaration order.
    pub edges: Vec<GraphEdge>,
}

/// One subject's outcome within a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectOutcome {
    /// Canonical subject path.
    pub subject_path: String,
    /// Final status.
    pub status: AnalysisStatus,
    /// Status message (`success`, `failure`, `skipped`, ...).
    pub status_message: String,
    /// Diagnostic message.
    #[serde(default)]
    pub message: String,
    /// Output paths.
    #[serde(default)]
    pub output_paths: Vec<String>,
    /// When the node function was invoked.
    #[serde(default, with = "optional_timestamp")]
    pub start_time: Option<Timestamp>,
    /// When the subject finished.
    #[serde(default, with = "optional_timestamp")]
    pub end_time: Option<Timestamp>,
}

/// Aggregate outcome of one node in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// Node id.
    pub node_id: String,
    /// Display name.
    pub name: String,
    /// When the node began.
    #[serde(default, with = "optional_timestamp")]
    pub started_at: Option<Timestamp>,
    /// When the node finished.
    #[serde(default, with = "optional_timestamp")]
    pub finished_at: Option<Timestamp>,
    /// Aggregate status.
    pub status: OutcomeStatus,
    /// Node-level diagnostic.
    #[serde(default)]
    pub message: String,
    /// Output paths per canonical subject path.
    #[serde(default)]
    pub output_paths: BTreeMap<String, Vec<String>>,
    /// Subject outcomes keyed by subject label; several files may share a label.
    #[serde(default)]
    pub subjects: BTreeMap<String, Vec<SubjectOutcome>>,
    /// Subject paths per group, keyed by the `/`-joined group tuple.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl NodeOutcome {
    /// Creates an outcome for a node that just started.
    #[must_use]
    pub fn running(node_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            started_at: Some(now_local()),
            finished_at: None,
            status: OutcomeStatus::Running,
            message: String::new(),
            output_paths: BTreeMap::new(),
            subjects: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Summarizes a finished ledger.
    #[must_use]
    pub fn from_ledger(
        node_id: impl Into<String>,
        name: impl Into<String>,
        started_at: Option<Timestamp>,
        ledger: &AnalysisLedger,
    ) -> Self {
        let status = if ledger.aggregate_status() == AnalysisStatus::Error {
            OutcomeStatus::Error
        } else {
            OutcomeStatus::Success
        };

        let mut output_paths = BTreeMap::new();
        let mut subjects: BTreeMap<String, Vec<SubjectOutcome>> = BTreeMap::new();
        for record in ledger.records() {
            output_paths.insert(record.subject_path.to_string(), record.output_paths.clone());
            subjects.entry(record.label()).or_default().push(SubjectOutcome {
                subject_path: record.subject_path.to_string(),
                status: record.status,
                status_message: record.status.message().to_string(),
                message: record.message.clone(),
                output_paths: record.output_paths.clone(),
                start_time: record.start_time,
                end_time: record.end_time,
            });
        }

        let groups = ledger
            .grouped()
            .into_iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, members)| {
                (key.join("/"), members.iter().map(ToString::to_string).collect())
            })
            .collect();

        Self {
            node_id: node_id.into(),
            name: name.into(),
            started_at,
            finished_at: Some(now_local()),
            status,
            message: ledger.status_message().to_string(),
            output_paths,
            subjects,
            groups,
        }
    }

    /// Creates an error outcome for a node that never started.
    #[must_use]
    pub fn not_started(
        node_id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            started_at: None,
            finished_at: Some(now_local()),
            status: OutcomeStatus::Error,
            message: message.into(),
            output_paths: BTreeMap::new(),
            subjects: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Creates an error outcome for a node that started but could not be
    /// recorded as finished.
    #[must_use]
    pub fn failed(
        node_id: impl Into<String>,
        name: impl Into<String>,
        started_at: Option<Timestamp>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            started_at,
            ..Self::not_started(node_id, name, message)
        }
    }

    /// Iterates over every subject outcome.
    pub fn subject_outcomes(&self) -> impl Iterator<Item = &SubjectOutcome> {
        self.subjects.values().flatten()
    }
}

/// Run-scoped aggregate of every node outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Project id.
    pub project_id: String,
    /// Run id.
    pub run_id: String,
    /// Display name.
    pub name: String,
    /// Declared node graph.
    #[serde(default)]
    pub graph: RunGraph,
    /// When the run (last) started.
    #[serde(with = "crate::utils::timestamps::required_timestamp")]
    pub started_at: Timestamp,
    /// When the run finished.
    #[serde(default, with = "optional_timestamp")]
    pub finished_at: Option<Timestamp>,
    /// Overall status.
    pub status: OutcomeStatus,
    /// Outcomes keyed by node id.
    #[serde(default)]
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
}

impl RunManifest {
    /// Creates an empty, running manifest.
    #[must_use]
    pub fn new(run: &RunKey, name: impl Into<String>, graph: RunGraph) -> Self {
        Self {
            project_id: run.project_id.clone(),
            run_id: run.run_id.clone(),
            name: name.into(),
            graph,
            started_at: now_local(),
            finished_at: None,
            status: OutcomeStatus::Running,
            node_outcomes: BTreeMap::new(),
        }
    }

    /// The run key.
    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.project_id, &self.run_id)
    }

    /// Prepares a loaded manifest for another execution.
    ///
    /// Resets the start time and status, clears the finish time and marks
    /// every requested node running. Recorded outcome data stays until a
    /// node replaces it.
    pub fn reopen<'a>(&mut self, graph: RunGraph, requested: impl IntoIterator<Item = &'a str>) {
        self.graph = graph;
        self.started_at = now_local();
        self.finished_at = None;
        self.status = OutcomeStatus::Running;
        for node_id in requested {
            if let Some(outcome) = self.node_outcomes.get_mut(node_id) {
                outcome.status = OutcomeStatus::Running;
                outcome.finished_at = None;
            }
        }
    }

    /// Replaces a node's outcome.
    pub fn set_node_outcome(&mut self, outcome: NodeOutcome) {
        self.node_outcomes.insert(outcome.node_id.clone(), outcome);
    }

    /// Overall status folded from the node outcomes.
    #[must_use]
    pub fn folded_status(&self) -> OutcomeStatus {
        OutcomeStatus::fold(self.node_outcomes.values().map(|o| &o.status))
    }

    /// Returns true if any node outcome is still running.
    #[must_use]
    pub fn has_running_nodes(&self) -> bool {
        self.node_outcomes
            .values()
            .any(|o| o.status == OutcomeStatus::Running)
    }
}

/// Storage backend for run manifests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Loads a manifest, if the run exists.
    async fn load(&self, run: &RunKey) -> Result<Option<RunManifest>, DerivflowError>;

    /// Overwrites a manifest in full.
    async fn save(&self, manifest: &RunManifest) -> Result<(), DerivflowError>;
}

/// Manifests stored as `experiment.json` below a workspace directory.
#[derive(Debug, Clone)]
pub struct JsonFileManifestStore {
    workspace: PathBuf,
}

impl JsonFileManifestStore {
    /// Creates a store below a workspace directory.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Path of a run's manifest.
    #[must_use]
    pub fn manifest_path(&self, run: &RunKey) -> PathBuf {
        run.dir_in(&self.workspace).join(MANIFEST_FILE_NAME)
    }
}

#[async_trait]
impl ManifestStore for JsonFileManifestStore {
    async fn load(&self, run: &RunKey) -> Result<Option<RunManifest>, DerivflowError> {
        read_json_opt(&self.manifest_path(run)).await
    }

    async fn save(&self, manifest: &RunManifest) -> Result<(), DerivflowError> {
        write_json_atomic(&self.manifest_path(&manifest.key()), manifest).await
    }
}

/// In-memory manifests.
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    manifests: DashMap<RunKey, RunManifest>,
}

impl InMemoryManifestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn load(&self, run: &RunKey) -> Result<Option<RunManifest>, DerivflowError> {
        Ok(self.manifests.get(run).map(|m| m.value().clone()))
    }

    async fn save(&self, manifest: &RunManifest) -> Result<(), DerivflowError> {
        self.manifests.insert(manifest.key(), manifest.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph() -> RunGraph {
        RunGraph {
            nodes: vec![
                GraphNode { id: "align".into(), name: "Align".into(), kind: "alignment".into() },
                GraphNode { id: "seg".into(), name: "Segment".into(), kind: "segment1".into() },
            ],
            edges: vec![GraphEdge { source: "align".into(), target: "seg".into() }],
        }
    }

    fn finished_ledger() -> AnalysisLedger {
        let mut ledger = AnalysisLedger::create(
            ["/data/sub-01_T1w.nii", "/data/sub-01_T2w.nii", "/data/sub-02_T1w.nii"],
            vec![("/data/sub-01_T1w.nii", vec!["patients".to_string()])],
            NodeKind::from("alignment"),
        )
        .unwrap();
        for s in ["/data/sub-01_T1w.nii", "/data/sub-01_T2w.nii"] {
            ledger.set_status(s, AnalysisStatus::Processing).unwrap();
            ledger.set_status(s, AnalysisStatus::Processed).unwrap();
            ledger.set_output_paths(s, [format!("{s}.out")]).unwrap();
        }
        ledger.set_status("/data/sub-02_T1w.nii", AnalysisStatus::Error).unwrap();
        ledger.set_message("/data/sub-02_T1w.nii", "boom").unwrap();
        ledger
    }

    #[test]
    fn test_outcome_from_ledger() {
        let outcome = NodeOutcome::from_ledger("align", "Align", Some(now_local()), &finished_ledger());

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.message, "success");
        assert_eq!(outcome.output_paths.len(), 3);
        assert_eq!(outcome.subjects["01"].len(), 2);
        assert_eq!(outcome.subjects["02"][0].status_message, "failure");
        assert_eq!(outcome.subjects["02"][0].message, "boom");
        assert_eq!(outcome.groups["patients"].len(), 1);
        assert_eq!(outcome.subject_outcomes().count(), 3);
        assert!(outcome.finished_at.is_some());
    }

    #[test]
    fn test_reopen_keeps_outcomes() {
        let run = RunKey::new("p1", "r1");
        let mut manifest = RunManifest::new(&run, "demo", graph());
        manifest.set_node_outcome(NodeOutcome::from_ledger("align", "Align", None, &finished_ledger()));
        manifest.status = manifest.folded_status();
        manifest.finished_at = Some(now_local());

        manifest.reopen(graph(), ["align"]);

        assert_eq!(manifest.status, OutcomeStatus::Running);
        assert!(manifest.finished_at.is_none());
        let align = &manifest.node_outcomes["align"];
        assert_eq!(align.status, OutcomeStatus::Running);
        assert_eq!(align.output_paths.len(), 3);
        assert!(manifest.has_running_nodes());
    }

    #[test]
    fn test_folded_status() {
        let run = RunKey::new("p1", "r1");
        let mut manifest = RunManifest::new(&run, "demo", graph());
        manifest.set_node_outcome(NodeOutcome::from_ledger("align", "Align", None, &finished_ledger()));
        assert_eq!(manifest.folded_status(), OutcomeStatus::Success);

        manifest.set_node_outcome(NodeOutcome::not_started("seg", "Segment", "not started"));
        assert_eq!(manifest.folded_status(), OutcomeStatus::Error);

        manifest.set_node_outcome(NodeOutcome::running("seg", "Segment"));
        assert_eq!(manifest.folded_status(), OutcomeStatus::Running);
    }

    #[test]
    fn test_manifest_document_fields() {
        let run = RunKey::new("p1", "r1");
        let manifest = RunManifest::new(&run, "demo", graph());
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["project_id"], json!("p1"));
        assert_eq!(value["run_id"], json!("r1"));
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["finished_at"], json!(null));
        assert_eq!(value["graph"]["edges"][0]["source"], json!("align"));
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileManifestStore::new(dir.path());
        let run = RunKey::new("p1", "r1");

        assert!(store.load(&run).await.unwrap().is_none());

        let mut manifest = RunManifest::new(&run, "demo", graph());
        manifest.set_node_outcome(NodeOutcome::from_ledger("align", "Align", Some(now_local()), &finished_ledger()));
        store.save(&manifest).await.unwrap();

        assert!(store.manifest_path(&run).ends_with("p1/r1/experiment.json"));
        let loaded = store.load(&run).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryManifestStore::new();
        let run = RunKey::new("p1", "r1");
        let manifest = RunManifest::new(&run, "demo", graph());
        store.save(&manifest).await.unwrap();
        assert_eq!(store.load(&run).await.unwrap(), Some(manifest));
        assert!(store.load(&RunKey::new("p1", "r2")).await.unwrap().is_none());
    }
}
