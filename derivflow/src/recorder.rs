//! Run recorder: durable manifest and resume index bookkeeping.
//!
//! Every manifest update is a read-modify-write of the whole document under
//! a per-run lock, so concurrent node or subject tasks never interleave
//! writes for the same run and no recorded node is ever lost.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::{OutcomeStatus, SubjectPath};
use crate::errors::DerivflowError;
use crate::ledger::AnalysisLedger;
use crate::store::{
    ManifestStore, NodeOutcome, ResumeEntry, ResumeIndex, ResumeStore, RunGraph, RunKey,
    RunManifest,
};
use crate::utils::now_local;

/// Persists run manifests and resume indexes.
pub struct RunRecorder {
    manifests: Arc<dyn ManifestStore>,
    resume: Arc<dyn ResumeStore>,
    locks: DashMap<RunKey, Arc<Mutex<()>>>,
    content_digests: bool,
}

impl RunRecorder {
    /// Creates a recorder over the given stores.
    #[must_use]
    pub fn new(manifests: Arc<dyn ManifestStore>, resume: Arc<dyn ResumeStore>) -> Self {
        Self {
            manifests,
            resume,
            locks: DashMap::new(),
            content_digests: false,
        }
    }

    /// Records SHA-256 digests of output files in resume indexes.
    #[must_use]
    pub fn with_content_digests(mut self, enabled: bool) -> Self {
        self.content_digests = enabled;
        self
    }

    /// Loads the run's manifest and prepares it for execution, or creates a
    /// new running manifest from the graph.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the manifest cannot be read or written.
    pub async fn open_or_create(
        &self,
        run: &RunKey,
        name: &str,
        graph: RunGraph,
    ) -> Result<RunManifest, DerivflowError> {
        let lock = self.lock_for(run);
        let _guard = lock.lock().await;

        let manifest = match self.load_unlocked(run).await? {
            Some(mut existing) => {
                info!(run = %run, "Reopening existing run");
                let requested: Vec<String> = graph.nodes.iter().map(|n| n.id.clone()).collect();
                existing.reopen(graph, requested.iter().map(String::as_str));
                existing.name = name.to_string();
                existing
            }
            None => {
                info!(run = %run, "Creating run manifest");
                RunManifest::new(run, name, graph)
            }
        };
        self.save_unlocked(&manifest).await?;
        Ok(manifest)
    }

    /// Stamps a node as running, before any subject is processed.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Persistence`.
    pub async fn mark_node_started(
        &self,
        run: &RunKey,
        node_id: &str,
        name: &str,
    ) -> Result<(), DerivflowError> {
        self.update(run, |manifest| {
            manifest.set_node_outcome(NodeOutcome::running(node_id, name));
        })
        .await
        .map(drop)
    }

    /// Merges a finished ledger into the node's outcome, replacing any prior
    /// outcome for the same node, and rewrites the manifest.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Persistence`.
    pub async fn record_node_outcome(
        &self,
        run: &RunKey,
        node_id: &str,
        name: &str,
        ledger: &AnalysisLedger,
    ) -> Result<NodeOutcome, DerivflowError> {
        let mut recorded = None;
        self.update(run, |manifest| {
            let started_at = manifest
                .node_outcomes
                .get(node_id)
                .and_then(|o| o.started_at);
            let outcome = NodeOutcome::from_ledger(node_id, name, started_at, ledger);
            recorded = Some(outcome.clone());
            manifest.set_node_outcome(outcome);
        })
        .await?;
        let outcome = recorded.ok_or_else(|| DerivflowError::persistence("node outcome was not recorded"))?;
        info!(run = %run, node_id, status = %outcome.status, "Recorded node outcome");
        Ok(outcome)
    }

    /// Records a started node as failed, keeping its start stamp.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Persistence`.
    pub async fn mark_node_failed(
        &self,
        run: &RunKey,
        node_id: &str,
        name: &str,
        message: &str,
    ) -> Result<(), DerivflowError> {
        self.update(run, |manifest| {
            let started_at = manifest
                .node_outcomes
                .get(node_id)
                .and_then(|o| o.started_at);
            manifest.set_node_outcome(NodeOutcome::failed(node_id, name, started_at, message));
        })
        .await
        .map(drop)
    }

    /// Records a node that can no longer start as failed.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Persistence`.
    pub async fn mark_not_started(
        &self,
        run: &RunKey,
        node_id: &str,
        name: &str,
        message: &str,
    ) -> Result<(), DerivflowError> {
        self.update(run, |manifest| {
            manifest.set_node_outcome(NodeOutcome::not_started(node_id, name, message));
        })
        .await
        .map(drop)
    }

    /// Writes the node's resume index from a finished ledger.
    ///
    /// Skipped subjects carry their upstream outputs in the ledger; `reused`
    /// holds the entries they were skipped on, which replace them in the
    /// index so the next run checks the node's own outputs.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the index cannot be written.
    pub async fn record_resume_index(
        &self,
        run: &RunKey,
        node_id: &str,
        ledger: &AnalysisLedger,
        reused: Vec<(SubjectPath, ResumeEntry)>,
    ) -> Result<ResumeIndex, DerivflowError> {
        let mut index = ResumeIndex::from_ledger(ledger, self.content_digests)?;
        for (subject, entry) in reused {
            index.insert(subject, entry);
        }
        self.resume
            .save_index(run, node_id, &index)
            .await
            .map_err(into_persistence)?;
        debug!(run = %run, node_id, entries = index.len(), "Recorded resume index");
        Ok(index)
    }

    /// Looks up the most recently persisted resume entry of a subject.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the index cannot be read.
    pub async fn resume_entry(
        &self,
        run: &RunKey,
        node_id: &str,
        subject: &SubjectPath,
    ) -> Result<Option<ResumeEntry>, DerivflowError> {
        self.resume
            .get_entry(run, node_id, subject)
            .await
            .map_err(into_persistence)
    }

    /// Loads a node's resume index.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the index cannot be read.
    pub async fn resume_index(
        &self,
        run: &RunKey,
        node_id: &str,
    ) -> Result<Option<ResumeIndex>, DerivflowError> {
        self.resume
            .load_index(run, node_id)
            .await
            .map_err(into_persistence)
    }

    /// Sets the overall status and finish time once no node is running.
    ///
    /// While a node is still running the manifest is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` or `Persistence`.
    pub async fn finalize(&self, run: &RunKey) -> Result<RunManifest, DerivflowError> {
        let manifest = self
            .update(run, |manifest| {
                if !manifest.has_running_nodes() {
                    manifest.status = manifest.folded_status();
                    manifest.finished_at = Some(now_local());
                }
            })
            .await?;
        if manifest.status != OutcomeStatus::Running {
            info!(run = %run, status = %manifest.status, "Run finalized");
        }
        Ok(manifest)
    }

    /// Loads a run's manifest.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    pub async fn load(&self, run: &RunKey) -> Result<RunManifest, DerivflowError> {
        self.load_unlocked(run).await?.ok_or_else(|| not_found(run))
    }

    async fn update<F>(&self, run: &RunKey, f: F) -> Result<RunManifest, DerivflowError>
    where
        F: FnOnce(&mut RunManifest),
    {
        let lock = self.lock_for(run);
        let _guard = lock.lock().await;

        let mut manifest = self.load_unlocked(run).await?.ok_or_else(|| not_found(run))?;
        f(&mut manifest);
        self.save_unlocked(&manifest).await?;
        Ok(manifest)
    }

    async fn load_unlocked(&self, run: &RunKey) -> Result<Option<RunManifest>, DerivflowError> {
        self.manifests.load(run).await.map_err(into_persistence)
    }

    async fn save_unlocked(&self, manifest: &RunManifest) -> Result<(), DerivflowError> {
        self.manifests.save(manifest).await.map_err(into_persistence)
    }

    fn lock_for(&self, run: &RunKey) -> Arc<Mutex<()>> {
        self.locks.entry(run.clone()).or_default().clone()
    }
}

fn not_found(run: &RunKey) -> DerivflowError {
    DerivflowError::RunNotFound {
        project_id: run.project_id.clone(),
        run_id: run.run_id.clone(),
    }
}

fn into_persistence(err: DerivflowError) -> DerivflowError {
    match err {
        DerivflowError::Persistence(_) => err,
        other => DerivflowError::persistence(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AnalysisStatus, NodeKind};
    use crate::store::manifest::MockManifestStore;
    use crate::store::{GraphNode, InMemoryManifestStore, InMemoryResumeStore, JsonFileManifestStore};
    use pretty_assertions::assert_eq;

    fn graph() -> RunGraph {
        RunGraph {
            nodes: vec![
                GraphNode { id: "align".into(), name: "Align".into(), kind: "alignment".into() },
                GraphNode { id: "seg".into(), name: "Segment".into(), kind: "segment1".into() },
            ],
            edges: Vec::new(),
        }
    }

    fn recorder() -> RunRecorder {
        RunRecorder::new(
            Arc::new(InMemoryManifestStore::new()),
            Arc::new(InMemoryResumeStore::new()),
        )
    }

    fn ledger(statuses: &[AnalysisStatus]) -> AnalysisLedger {
        let paths: Vec<String> = (0..statuses.len()).map(|i| format!("/data/sub-{i:02}.nii")).collect();
        let mut ledger = AnalysisLedger::create(&paths, Vec::<(String, Vec<String>)>::new(), NodeKind::from("alignment")).unwrap();
        for (path, status) in paths.iter().zip(statuses) {
            if *status == AnalysisStatus::Processed {
                ledger.set_status(path, AnalysisStatus::Processing).unwrap();
            }
            ledger.set_status(path, *status).unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn test_open_creates_running_manifest() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        let manifest = recorder.open_or_create(&run, "demo", graph()).await.unwrap();
        assert_eq!(manifest.status, OutcomeStatus::Running);
        assert!(manifest.node_outcomes.is_empty());
        assert_eq!(recorder.load(&run).await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn test_record_keeps_other_nodes() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        recorder.open_or_create(&run, "demo", graph()).await.unwrap();

        recorder.mark_node_started(&run, "align", "Align").await.unwrap();
        let align = recorder
            .record_node_outcome(&run, "align", "Align", &ledger(&[AnalysisStatus::Processed]))
            .await
            .unwrap();
        assert!(align.started_at.is_some());

        recorder.mark_node_started(&run, "seg", "Segment").await.unwrap();
        recorder
            .record_node_outcome(&run, "seg", "Segment", &ledger(&[AnalysisStatus::Error]))
            .await
            .unwrap();

        let manifest = recorder.load(&run).await.unwrap();
        assert_eq!(manifest.node_outcomes["align"], align);
        assert_eq!(manifest.node_outcomes["seg"].status, OutcomeStatus::Error);
    }

    #[tokio::test]
    async fn test_finalize_waits_for_running_nodes() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        recorder.open_or_create(&run, "demo", graph()).await.unwrap();
        recorder.mark_node_started(&run, "align", "Align").await.unwrap();

        let manifest = recorder.finalize(&run).await.unwrap();
        assert_eq!(manifest.status, OutcomeStatus::Running);
        assert!(manifest.finished_at.is_none());

        recorder
            .record_node_outcome(&run, "align", "Align", &ledger(&[AnalysisStatus::Processed, AnalysisStatus::Error]))
            .await
            .unwrap();
        let manifest = recorder.finalize(&run).await.unwrap();
        assert_eq!(manifest.status, OutcomeStatus::Success);
        assert!(manifest.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_not_started_finalizes_to_error() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        recorder.open_or_create(&run, "demo", graph()).await.unwrap();
        recorder
            .record_node_outcome(&run, "align", "Align", &ledger(&[AnalysisStatus::Processed]))
            .await
            .unwrap();
        recorder
            .mark_not_started(&run, "seg", "Segment", "not started: upstream node 'align' failed")
            .await
            .unwrap();

        let manifest = recorder.finalize(&run).await.unwrap();
        assert_eq!(manifest.status, OutcomeStatus::Error);
        assert!(manifest.node_outcomes["seg"].message.starts_with("not started"));
    }

    #[tokio::test]
    async fn test_failed_node_keeps_start_stamp() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        recorder.open_or_create(&run, "demo", graph()).await.unwrap();
        recorder.mark_node_started(&run, "align", "Align").await.unwrap();
        let started_at = recorder.load(&run).await.unwrap().node_outcomes["align"].started_at;

        recorder
            .mark_node_failed(&run, "align", "Align", "cannot scan derivative root")
            .await
            .unwrap();

        let manifest = recorder.finalize(&run).await.unwrap();
        let align = &manifest.node_outcomes["align"];
        assert!(started_at.is_some());
        assert_eq!(align.started_at, started_at);
        assert!(align.finished_at.is_some());
        assert_eq!(align.status, OutcomeStatus::Error);
        assert_eq!(align.message, "cannot scan derivative root");
        assert_eq!(manifest.status, OutcomeStatus::Error);
    }

    #[tokio::test]
    async fn test_reopen_marks_requested_nodes_running() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RunRecorder::new(
            Arc::new(JsonFileManifestStore::new(dir.path())),
            Arc::new(InMemoryResumeStore::new()),
        );
        let run = RunKey::new("p1", "r1");
        recorder.open_or_create(&run, "demo", graph()).await.unwrap();
        recorder
            .record_node_outcome(&run, "align", "Align", &ledger(&[AnalysisStatus::Processed]))
            .await
            .unwrap();
        recorder.finalize(&run).await.unwrap();

        let reopened = recorder.open_or_create(&run, "demo again", graph()).await.unwrap();
        assert_eq!(reopened.status, OutcomeStatus::Running);
        assert_eq!(reopened.name, "demo again");
        assert_eq!(reopened.node_outcomes["align"].status, OutcomeStatus::Running);
        assert_eq!(reopened.node_outcomes["align"].output_paths.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_index_round_trip() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        let ledger = ledger(&[AnalysisStatus::Processed, AnalysisStatus::Error]);
        recorder.record_resume_index(&run, "align", &ledger, Vec::new()).await.unwrap();

        let subject = SubjectPath::new("/data/sub-00.nii").unwrap();
        let entry = recorder.resume_entry(&run, "align", &subject).await.unwrap().unwrap();
        assert!(entry.success);
        let index = recorder.resume_index(&run, "align").await.unwrap().unwrap();
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_resume_index_keeps_reused_entries() {
        let recorder = recorder();
        let run = RunKey::new("p1", "r1");
        let mut ledger = ledger(&[AnalysisStatus::Skipped]);
        ledger.set_output_paths("/data/sub-00.nii", ["/data/sub-00.nii"]).unwrap();
        let subject = SubjectPath::new("/data/sub-00.nii").unwrap();
        let own = ResumeEntry::success(["/work/seg/sub-00/seg.nii"]);

        let index = recorder
            .record_resume_index(&run, "seg", &ledger, vec![(subject.clone(), own.clone())])
            .await
            .unwrap();

        assert_eq!(index.get(&subject), Some(&own));
        assert_eq!(recorder.resume_entry(&run, "seg", &subject).await.unwrap(), Some(own));
    }

    #[tokio::test]
    async fn test_missing_run() {
        let recorder = recorder();
        let err = recorder
            .mark_node_started(&RunKey::new("p1", "nope"), "align", "Align")
            .await
            .unwrap_err();
        assert!(matches!(err, DerivflowError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_write_failure_is_persistence_error() {
        let mut store = MockManifestStore::new();
        store.expect_load().returning(|_| Ok(None));
        store
            .expect_save()
            .returning(|_| Err(DerivflowError::Io(std::io::Error::other("disk full"))));
        let recorder = RunRecorder::new(Arc::new(store), Arc::new(InMemoryResumeStore::new()));

        let err = recorder
            .open_or_create(&RunKey::new("p1", "r1"), "demo", graph())
            .await
            .unwrap_err();
        assert!(matches!(err, DerivflowError::Persistence(ref m) if m.contains("disk full")));
    }
}
