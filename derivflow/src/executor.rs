//! Node executor: runs one node for every subject.
//!
//! Per subject, in order:
//!
//! 1. an upstream failure marks the subject `previous_error`;
//! 2. a usable previous result marks it `skipped` and passes the upstream
//!    outputs on unchanged (the raw subject file for a root node);
//! 3. missing inputs mark it `error`; stale output is removed;
//! 4. the node function runs in a fresh output directory;
//! 5. its outputs mark the subject `processed`, any error or panic `error`.
//!
//! A node whose subjects all failed is fatal: its outcome is recorded, no
//! resume index is written, no derivatives are collected and
//! `AllSubjectsFailed` is returned.

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::core::{AnalysisStatus, SubjectPath};
use crate::errors::{DerivflowError, FailureDetail};
use crate::events::{names, EngineEvent, EventSink};
use crate::gc::DerivativeGc;
use crate::ledger::AnalysisLedger;
use crate::node::{Artifact, NodeArtifacts, RegisteredNode, SubjectInvocation, SUBJECT_INPUT_KEY};
use crate::recorder::RunRecorder;
use crate::skip::{ParamFingerprint, SkipPolicy};
use crate::store::{ArtifactStore, DatasetDescription, ResumeEntry, RunKey};

/// Parameter key enabling skip-on-rerun for a node.
pub const SKIP_ANALYZED_PARAM: &str = "skip_analyzed";

/// Where a node's subjects come from.
#[derive(Debug)]
pub enum NodeInput<'a> {
    /// A root node: a ledger created from the raw subject list.
    Root(AnalysisLedger),
    /// Upstream node ids and their finished ledgers. The first one is the
    /// ledger this node derives from.
    Upstream(Vec<(&'a str, &'a AnalysisLedger)>),
}

/// One node to execute.
pub struct NodeTask<'a> {
    /// Run being executed.
    pub run: &'a RunKey,
    /// Run whose resume index feeds the skip policy.
    pub resume_from: &'a RunKey,
    /// Node id.
    pub node_id: &'a str,
    /// Display name.
    pub name: &'a str,
    /// Node parameters.
    pub params: Arc<serde_json::Value>,
    /// Registered kind of the node.
    pub node: &'a RegisteredNode,
    /// Derivative storage of the project.
    pub artifacts: &'a ArtifactStore,
    /// Subject source.
    pub input: NodeInput<'a>,
}

/// Immutable per-node state shared by subject tasks.
struct SubjectEnv<'a> {
    run: &'a RunKey,
    resume_from: &'a RunKey,
    node_id: &'a str,
    params: &'a Arc<serde_json::Value>,
    node: &'a RegisteredNode,
    artifacts: &'a ArtifactStore,
    upstream: &'a [(&'a str, &'a AnalysisLedger)],
    skip_enabled: bool,
    fingerprint: ParamFingerprint,
    gc: Option<&'a DerivativeGc>,
    reused: Mutex<Vec<(SubjectPath, ResumeEntry)>>,
}

/// Executes nodes against the run recorder.
pub struct NodeExecutor {
    config: EngineConfig,
    recorder: Arc<RunRecorder>,
    sink: Arc<dyn EventSink>,
    skip_policy: SkipPolicy,
}

impl NodeExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(config: EngineConfig, recorder: Arc<RunRecorder>, sink: Arc<dyn EventSink>) -> Self {
        let skip_policy = SkipPolicy::new(config.verify_content_digests);
        Self {
            config,
            recorder,
            sink,
            skip_policy,
        }
    }

    /// Runs a node for all subjects and returns its finished ledger.
    ///
    /// # Errors
    ///
    /// Returns `AllSubjectsFailed` if no subject succeeded, `Persistence` if
    /// the recorder fails, or `Io` if the derivative root cannot be scanned.
    pub async fn execute(&self, task: NodeTask<'_>) -> Result<AnalysisLedger, DerivflowError> {
        let span = info_span!("node", run = %task.run, node_id = task.node_id);
        self.execute_inner(task).instrument(span).await
    }

    async fn execute_inner(&self, task: NodeTask<'_>) -> Result<AnalysisLedger, DerivflowError> {
        let kind = task.node.descriptor.kind.clone();
        let (ledger, upstream) = match task.input {
            NodeInput::Root(ledger) => (ledger, Vec::new()),
            NodeInput::Upstream(upstream) => {
                let (_, first) = upstream.first().ok_or_else(|| {
                    DerivflowError::Validation(
                        crate::errors::PipelineValidationError::new(format!(
                            "Node '{}' has no upstream ledger",
                            task.node_id
                        ))
                        .with_nodes(vec![task.node_id.to_string()]),
                    )
                })?;
                (first.derive(kind.clone()), upstream)
            }
        };

        self.recorder
            .mark_node_started(task.run, task.node_id, task.name)
            .await?;
        self.sink
            .emit(
                EngineEvent::node(names::NODE_STARTED, &task.run.run_id, task.node_id)
                    .with_data(json!({"kind": kind, "subjects": ledger.len()})),
            )
            .await;
        info!(kind = %kind, subjects = ledger.len(), "Node started");

        let gc = DerivativeGc::scan(task.artifacts.node_dir(&task.run.run_id, task.node_id))?;
        let skip_enabled = task
            .params
            .get(SKIP_ANALYZED_PARAM)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(self.config.skip_analyzed_default);

        let env = SubjectEnv {
            run: task.run,
            resume_from: task.resume_from,
            node_id: task.node_id,
            params: &task.params,
            node: task.node,
            artifacts: task.artifacts,
            upstream: &upstream,
            skip_enabled,
            fingerprint: task.node.fingerprint(&task.params),
            gc: Some(&gc),
            reused: Mutex::new(Vec::new()),
        };

        let subjects: Vec<SubjectPath> = ledger.subjects().cloned().collect();
        let ledger = Mutex::new(ledger);
        let concurrency = self.config.max_concurrent_subjects.max(1);
        let mut results = futures::stream::iter(subjects)
            .map(|subject| self.process_subject(&env, &ledger, subject))
            .buffered(concurrency);
        while let Some(result) = results.next().await {
            result?;
        }
        drop(results);
        let ledger = ledger.into_inner();
        let reused = env.reused.into_inner();

        self.finish(
            task.run,
            task.node_id,
            task.name,
            &task.params,
            task.node,
            task.artifacts,
            skip_enabled,
            ledger,
            reused,
            gc,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &RunKey,
        node_id: &str,
        name: &str,
        params: &serde_json::Value,
        node: &RegisteredNode,
        artifacts: &ArtifactStore,
        skip_enabled: bool,
        ledger: AnalysisLedger,
        reused: Vec<(SubjectPath, ResumeEntry)>,
        gc: DerivativeGc,
    ) -> Result<AnalysisLedger, DerivflowError> {
        if ledger.aggregate_status() == AnalysisStatus::Error {
            self.recorder.record_node_outcome(run, node_id, name, &ledger).await?;
            let failed = ledger.failed_count();
            warn!(failed, "All subjects failed");
            self.sink
                .emit(
                    EngineEvent::node(names::NODE_FAILED, &run.run_id, node_id)
                        .with_data(json!({"failed": failed})),
                )
                .await;
            return Err(DerivflowError::AllSubjectsFailed {
                node_id: node_id.to_string(),
                failed,
            });
        }

        if self.config.write_dataset_description {
            let mut parameters = match params {
                serde_json::Value::Object(map) => map.clone(),
                serde_json::Value::Null => serde_json::Map::new(),
                other => serde_json::Map::from_iter([("value".to_string(), other.clone())]),
            };
            parameters.insert(SKIP_ANALYZED_PARAM.to_string(), json!(skip_enabled));
            let description = DatasetDescription::new(
                name,
                node.descriptor.kind.as_str(),
                serde_json::Value::Object(parameters),
            );
            artifacts
                .write_dataset_description(&run.run_id, node_id, &description)
                .map_err(|e| DerivflowError::persistence(format!("cannot write dataset description: {e}")))?;
        }

        self.recorder.record_resume_index(run, node_id, &ledger, reused).await?;
        let outcome = self.recorder.record_node_outcome(run, node_id, name, &ledger).await?;

        let removed = gc.sweep();
        if !removed.is_empty() {
            let dirs: Vec<String> = removed.iter().map(|d| d.display().to_string()).collect();
            self.sink
                .emit(
                    EngineEvent::node(names::DERIVATIVES_REMOVED, &run.run_id, node_id)
                        .with_data(json!({"directories": dirs})),
                )
                .await;
        }

        info!(status = %outcome.status, failed = ledger.failed_count(), "Node completed");
        self.sink
            .emit(
                EngineEvent::node(names::NODE_COMPLETED, &run.run_id, node_id)
                    .with_data(json!({"status": outcome.status, "failed": ledger.failed_count()})),
            )
            .await;
        Ok(ledger)
    }

    async fn process_subject(
        &self,
        env: &SubjectEnv<'_>,
        ledger: &Mutex<AnalysisLedger>,
        subject: SubjectPath,
    ) -> Result<AnalysisStatus, DerivflowError> {
        // 1. Upstream failure.
        if let Some(message) = upstream_failure(env.upstream, &subject) {
            {
                let mut ledger = ledger.lock();
                ledger.set_status(&subject, AnalysisStatus::PreviousError)?;
                ledger.set_message(&subject, message)?;
            }
            self.emit_subject(names::SUBJECT_PREVIOUS_ERROR, env, &subject).await;
            return Ok(AnalysisStatus::PreviousError);
        }

        // 2. Skip.
        let entry = self
            .recorder
            .resume_entry(env.resume_from, env.node_id, &subject)
            .await?;
        let decision = self
            .skip_policy
            .evaluate(&subject, env.skip_enabled, entry.as_ref(), &env.fingerprint);
        if let (true, Some(entry)) = (decision.is_skip(), entry) {
            let carried = carried_paths(env.upstream, &subject)?;
            if let Some(gc) = env.gc {
                gc.confirm(env.artifacts.subject_dir(&env.run.run_id, env.node_id, &subject));
            }
            {
                let mut ledger = ledger.lock();
                ledger.set_status(&subject, AnalysisStatus::Skipped)?;
                ledger.set_output_paths(&subject, &carried)?;
            }
            env.reused.lock().push((subject.clone(), entry));
            self.emit_subject(names::SUBJECT_SKIPPED, env, &subject).await;
            return Ok(AnalysisStatus::Skipped);
        }

        // 3. Inputs, then stale output.
        let inputs = match collect_inputs(env, &subject) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_subject(env, ledger, &subject, e.to_string(), false)?;
                self.emit_subject(names::SUBJECT_FAILED, env, &subject).await;
                return Ok(AnalysisStatus::Error);
            }
        };
        let output_dir = match prepare_output_dir(env, &subject) {
            Ok(dir) => dir,
            Err(e) => {
                let message = format!("cannot prepare output directory: {e}");
                self.fail_subject(env, ledger, &subject, message, false)?;
                self.emit_subject(names::SUBJECT_FAILED, env, &subject).await;
                return Ok(AnalysisStatus::Error);
            }
        };

        // 4. Compute.
        let (label, group) = {
            let mut ledger = ledger.lock();
            ledger.set_status(&subject, AnalysisStatus::Processing)?;
            ledger.mark_start(&subject)?;
            let record = ledger.record(&subject)?;
            (record.label(), record.group.clone())
        };
        let invocation = SubjectInvocation {
            run_id: env.run.run_id.clone(),
            node_id: env.node_id.to_string(),
            subject: subject.clone(),
            label: label.clone(),
            group,
            params: Arc::clone(env.params),
            inputs,
            output_dir,
        };
        debug!(subject = %subject, "Invoking node function");
        let result = AssertUnwindSafe(env.node.function.process(invocation))
            .catch_unwind()
            .await;

        // 5. Record.
        let failure = match result {
            Ok(Ok(artifacts)) => {
                let mut guard = ledger.lock();
                match guard.set_output_paths(&subject, artifacts.output_paths()) {
                    Ok(()) => {
                        guard.set_status(&subject, AnalysisStatus::Processed)?;
                        guard.mark_end(&subject)?;
                        None
                    }
                    Err(e) => Some(FailureDetail::new(&label, e.to_string())),
                }
            }
            Ok(Err(err)) => Some(FailureDetail::from_error(&label, &err, self.config.failure_trace_depth)),
            Err(payload) => Some(FailureDetail::from_panic(&label, payload.as_ref())),
        };

        match failure {
            None => {
                self.emit_subject(names::SUBJECT_PROCESSED, env, &subject).await;
                Ok(AnalysisStatus::Processed)
            }
            Some(detail) => {
                let err = DerivflowError::from(detail);
                warn!(subject = %subject, error = %err, "Node function failed");
                self.fail_subject(env, ledger, &subject, err.to_string(), true)?;
                self.emit_subject(names::SUBJECT_FAILED, env, &subject).await;
                Ok(AnalysisStatus::Error)
            }
        }
    }

    fn fail_subject(
        &self,
        env: &SubjectEnv<'_>,
        ledger: &Mutex<AnalysisLedger>,
        subject: &SubjectPath,
        message: String,
        started: bool,
    ) -> Result<(), DerivflowError> {
        debug!(node_id = env.node_id, subject = %subject, started, "Subject failed");
        let mut ledger = ledger.lock();
        ledger.set_status(subject, AnalysisStatus::Error)?;
        ledger.set_message(subject, message)?;
        ledger.mark_end(subject)
    }

    async fn emit_subject(&self, name: &'static str, env: &SubjectEnv<'_>, subject: &SubjectPath) {
        self.sink
            .emit(
                EngineEvent::node(name, &env.run.run_id, env.node_id)
                    .with_data(json!({"subject": subject})),
            )
            .await;
    }
}

/// Returns the propagated message if any upstream node failed for `subject`.
fn upstream_failure(upstream: &[(&str, &AnalysisLedger)], subject: &SubjectPath) -> Option<String> {
    for (node_id, ledger) in upstream {
        match ledger.record(subject) {
            Ok(record) if record.status.is_failure() => {
                return Some(if record.message.is_empty() {
                    format!("upstream node '{node_id}' failed")
                } else {
                    record.message.clone()
                });
            }
            Ok(_) => {}
            Err(_) => return Some(format!("subject was not processed by upstream node '{node_id}'")),
        }
    }
    None
}

/// Output paths a skipped subject passes on: the first upstream record's
/// outputs, or the raw subject file for a root node.
fn carried_paths(
    upstream: &[(&str, &AnalysisLedger)],
    subject: &SubjectPath,
) -> Result<Vec<String>, DerivflowError> {
    match upstream.first() {
        Some((_, ledger)) => Ok(ledger.record(subject)?.output_paths.clone()),
        None => Ok(vec![subject.to_string()]),
    }
}

/// Assembles the named inputs of a subject, checking that they exist.
fn collect_inputs(env: &SubjectEnv<'_>, subject: &SubjectPath) -> Result<NodeArtifacts, DerivflowError> {
    if env.upstream.is_empty() {
        if !subject.as_path().exists() {
            return Err(DerivflowError::InputMissing(subject.as_path().to_path_buf()));
        }
        return Ok(NodeArtifacts::new().with_path(SUBJECT_INPUT_KEY, subject.as_path()));
    }

    let mut inputs = NodeArtifacts::new();
    for (node_id, ledger) in env.upstream {
        let record = ledger.record(subject)?;
        let paths: Vec<PathBuf> = record.output_paths.iter().map(PathBuf::from).collect();
        if env.node.descriptor.requires_upstream_derivatives {
            if paths.is_empty() {
                let dir = env.artifacts.subject_dir(&env.run.run_id, node_id, subject);
                if !ArtifactStore::has_derivatives(&dir) {
                    return Err(DerivflowError::InputMissing(dir));
                }
            } else if let Some(missing) = paths.iter().find(|p| !p.exists()) {
                return Err(DerivflowError::InputMissing(missing.clone()));
            }
        }
        inputs.insert(*node_id, Artifact::Paths(paths));
    }
    Ok(inputs)
}

/// Removes stale output and reserves a fresh, confirmed output directory.
fn prepare_output_dir(env: &SubjectEnv<'_>, subject: &SubjectPath) -> std::io::Result<PathBuf> {
    env.artifacts
        .clear_subject_dir(&env.run.run_id, env.node_id, subject)?;
    let dir = env
        .artifacts
        .ensure_subject_dir(&env.run.run_id, env.node_id, subject)?;
    if let Some(gc) = env.gc {
        gc.confirm(&dir);
    }
    Ok(dir)
}
