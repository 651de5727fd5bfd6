//! Pipeline runner: executes every node of a validated pipeline in
//! dependency order for one run.

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

use super::{PipelineDefinition, PipelineGraph};
use crate::config::EngineConfig;
use crate::core::{OutcomeStatus, SUBJECT_NAME_PROPERTY};
use crate::errors::{DerivflowError, PipelineValidationError};
use crate::events::{names, EngineEvent, EventSink, NoOpEventSink};
use crate::executor::{NodeExecutor, NodeInput, NodeTask};
use crate::ledger::AnalysisLedger;
use crate::node::{Artifact, NodeArtifacts, NodeRegistry, LEDGER_KEY};
use crate::recorder::RunRecorder;
use crate::store::{
    ArtifactStore, JsonFileManifestStore, JsonFileResumeStore, ManifestStore, ResumeStore, RunKey, RunManifest,
};
use crate::utils::generate_run_id;

/// One pipeline run to execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Project the run belongs to.
    pub project_id: String,
    /// Run id; generated when the request is created.
    pub run_id: String,
    /// Run name recorded in the manifest.
    pub name: String,
    /// Project root; derivatives are written below it.
    pub project_root: PathBuf,
    /// The pipeline.
    pub definition: PipelineDefinition,
    /// Subject files, in discovery order.
    pub subjects: Vec<PathBuf>,
    /// Optional group assignment per subject.
    pub groups: BTreeMap<PathBuf, Vec<String>>,
    /// Run whose resume index feeds skip decisions; defaults to this run.
    pub resume_from: Option<String>,
}

impl RunRequest {
    /// Creates a request with a fresh run id.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        project_root: impl Into<PathBuf>,
        definition: PipelineDefinition,
    ) -> Self {
        let name = definition.name.clone();
        Self {
            project_id: project_id.into(),
            run_id: generate_run_id(),
            name,
            project_root: project_root.into(),
            definition,
            subjects: Vec::new(),
            groups: BTreeMap::new(),
            resume_from: None,
        }
    }

    /// Reuses an existing run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Sets the run name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the subject files.
    #[must_use]
    pub fn with_subjects<I, P>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the group assignment.
    #[must_use]
    pub fn with_groups(mut self, groups: BTreeMap<PathBuf, Vec<String>>) -> Self {
        self.groups = groups;
        self
    }

    /// Resumes skip decisions from another run.
    #[must_use]
    pub fn resuming_from(mut self, run_id: impl Into<String>) -> Self {
        self.resume_from = Some(run_id.into());
        self
    }

    /// The run's key.
    #[must_use]
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.project_id, &self.run_id)
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    /// Run id.
    pub run_id: String,
    /// Final manifest.
    pub manifest: RunManifest,
    /// Each node's output artifacts, carrying its ledger under
    /// [`LEDGER_KEY`].
    pub outputs: BTreeMap<String, NodeArtifacts>,
}

impl RunReport {
    /// Overall run status.
    #[must_use]
    pub fn status(&self) -> OutcomeStatus {
        self.manifest.status
    }

    /// The finished ledger of a node.
    #[must_use]
    pub fn ledger(&self, node_id: &str) -> Option<&AnalysisLedger> {
        self.outputs.get(node_id).and_then(NodeArtifacts::ledger)
    }
}

/// Runs pipelines against a node registry and a run recorder.
pub struct PipelineRunner {
    config: EngineConfig,
    registry: Arc<NodeRegistry>,
    recorder: Arc<RunRecorder>,
    sink: Arc<dyn EventSink>,
}

impl PipelineRunner {
    /// Creates a runner persisting to JSON files under the configured
    /// workspace directory.
    #[must_use]
    pub fn new(config: EngineConfig, registry: NodeRegistry) -> Self {
        let manifests: Arc<dyn ManifestStore> = Arc::new(JsonFileManifestStore::new(&config.workspace_dir));
        let resume: Arc<dyn ResumeStore> = Arc::new(JsonFileResumeStore::new(&config.workspace_dir));
        Self::with_stores(config, registry, manifests, resume)
    }

    /// Creates a runner over explicit stores.
    #[must_use]
    pub fn with_stores(
        config: EngineConfig,
        registry: NodeRegistry,
        manifests: Arc<dyn ManifestStore>,
        resume: Arc<dyn ResumeStore>,
    ) -> Self {
        let recorder = RunRecorder::new(manifests, resume).with_content_digests(config.verify_content_digests);
        Self {
            config,
            registry: Arc::new(registry),
            recorder: Arc::new(recorder),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Routes engine events to a sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The run recorder.
    #[must_use]
    pub fn recorder(&self) -> &Arc<RunRecorder> {
        &self.recorder
    }

    /// Validates a definition against the registry.
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `CycleDetected`, `UnknownNodeKind` or
    /// `InvalidConnection`.
    pub fn plan(&self, definition: PipelineDefinition) -> Result<PipelineGraph, DerivflowError> {
        let graph = PipelineGraph::build(definition)?;
        graph.check_connections(&self.registry)?;
        Ok(graph)
    }

    /// Executes a run.
    ///
    /// Nodes run one at a time in dependency order. If a node fails for every
    /// subject, the node's outcome is recorded, the nodes that did not run
    /// are recorded as not started, the run is finalized and
    /// `AllSubjectsFailed` is returned.
    ///
    /// # Errors
    ///
    /// Returns validation errors (including `DuplicateSubjectStem`) before
    /// anything is recorded, `AllSubjectsFailed` for a fatal node and
    /// `Persistence` if the run cannot be recorded.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, DerivflowError> {
        let span = info_span!("run", project_id = %request.project_id, run_id = %request.run_id);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: RunRequest) -> Result<RunReport, DerivflowError> {
        if request.subjects.is_empty() {
            return Err(PipelineValidationError::new("Run has no subjects")
                .with_fix_hint("Pass at least one subject file.")
                .into());
        }
        let graph = self.plan(request.definition.clone())?;
        let subjects = subject_ledger(&request, &graph)?;
        let artifacts = ArtifactStore::new(&request.project_root)?;
        let run = request.key();
        let resume_from = RunKey::new(
            &request.project_id,
            request.resume_from.as_deref().unwrap_or(&request.run_id),
        );

        self.recorder
            .open_or_create(&run, &request.name, graph.definition().run_graph())
            .await?;
        self.sink
            .emit(
                EngineEvent::run(names::RUN_STARTED, &run.run_id)
                    .with_data(json!({"project_id": run.project_id, "nodes": graph.execution_order()})),
            )
            .await;
        info!(nodes = graph.execution_order().len(), subjects = request.subjects.len(), "Run started");

        let executor = NodeExecutor::new(self.config.clone(), Arc::clone(&self.recorder), Arc::clone(&self.sink));
        let mut ledgers: HashMap<String, AnalysisLedger> = HashMap::new();
        for (position, node_id) in graph.execution_order().iter().enumerate() {
            let spec = graph.node(node_id)?;
            let node = self.registry.get(&spec.kind)?;

            let input = if spec.upstream.is_empty() {
                NodeInput::Root(subjects.derive(spec.kind.clone()))
            } else {
                let mut upstream = Vec::with_capacity(spec.upstream.len());
                for dep in &spec.upstream {
                    let ledger = ledgers.get(dep).ok_or_else(|| {
                        DerivflowError::from(
                            PipelineValidationError::new(format!("Node '{dep}' has not run before '{node_id}'"))
                                .with_nodes(vec![dep.clone(), node_id.clone()]),
                        )
                    })?;
                    upstream.push((dep.as_str(), ledger));
                }
                NodeInput::Upstream(upstream)
            };

            let result = executor
                .execute(NodeTask {
                    run: &run,
                    resume_from: &resume_from,
                    node_id,
                    name: spec.display_name(),
                    params: Arc::new(spec.params.clone()),
                    node,
                    artifacts: &artifacts,
                    input,
                })
                .await;

            match result {
                Ok(ledger) => {
                    ledgers.insert(node_id.clone(), ledger);
                }
                Err(err) => {
                    error!(node_id = %node_id, error = %err, "Node failed, halting run");
                    let remaining = &graph.execution_order()[position + 1..];
                    if let Err(bookkeeping) = self.halt(&run, &graph, node_id, remaining, &err).await {
                        error!(error = %bookkeeping, "Could not record the halted run");
                    }
                    return Err(err);
                }
            }
        }

        let manifest = self.recorder.finalize(&run).await?;
        self.emit_finished(&manifest).await;

        let outputs = ledgers
            .into_iter()
            .map(|(id, ledger)| (id, NodeArtifacts::new().with(LEDGER_KEY, Artifact::Ledger(ledger))))
            .collect();
        Ok(RunReport {
            run_id: run.run_id.clone(),
            manifest,
            outputs,
        })
    }

    /// Records the failed node and every node that will not run, then
    /// finalizes the run.
    ///
    /// A node that failed for every subject already has its outcome; any
    /// other failure is recorded against the node's start stamp.
    async fn halt(
        &self,
        run: &RunKey,
        graph: &PipelineGraph,
        failed: &str,
        remaining: &[String],
        err: &DerivflowError,
    ) -> Result<(), DerivflowError> {
        if !matches!(err, DerivflowError::AllSubjectsFailed { .. }) {
            let spec = graph.node(failed)?;
            self.recorder
                .mark_node_failed(run, failed, spec.display_name(), &err.to_string())
                .await?;
        }

        let downstream = graph.downstream_of(failed);
        for node_id in remaining {
            let spec = graph.node(node_id)?;
            let message = if downstream.contains(node_id) {
                format!("not started: upstream node '{failed}' failed")
            } else {
                format!("not started: run halted after node '{failed}' failed")
            };
            self.recorder
                .mark_not_started(run, node_id, spec.display_name(), &message)
                .await?;
        }

        let manifest = self.recorder.finalize(run).await?;
        self.emit_finished(&manifest).await;
        Ok(())
    }

    async fn emit_finished(&self, manifest: &RunManifest) {
        info!(status = %manifest.status, "Run finished");
        self.sink
            .emit(
                EngineEvent::run(names::RUN_FINISHED, &manifest.run_id)
                    .with_data(json!({"status": manifest.status})),
            )
            .await;
    }
}

/// Builds the labelled subject ledger every root node derives from.
fn subject_ledger(request: &RunRequest, graph: &PipelineGraph) -> Result<AnalysisLedger, DerivflowError> {
    let first = graph
        .execution_order()
        .first()
        .ok_or_else(|| PipelineValidationError::new("Pipeline has no nodes"))?;
    let mut ledger = AnalysisLedger::create(
        &request.subjects,
        request.groups.iter().map(|(path, group)| (path, group.clone())),
        graph.node(first)?.kind.clone(),
    )?;
    let subjects: Vec<_> = ledger.subjects().cloned().collect();
    for subject in subjects {
        let label = subject.label();
        ledger.set_property(&subject, SUBJECT_NAME_PROPERTY, json!(label))?;
    }
    Ok(ledger)
}
