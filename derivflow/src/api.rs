//! Request/response surface for callers such as the CLI.

use serde::Serialize;
use std::path::Path;

use crate::core::{AnalysisStatus, OutcomeStatus};
use crate::errors::DerivflowError;
use crate::pipeline::{PipelineRunner, RunRequest};
use crate::recorder::RunRecorder;
use crate::store::RunKey;
use crate::utils::canonical_path_string;

/// One subject's state within one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectStatus {
    /// Node id.
    pub node_id: String,
    /// Canonical subject path.
    pub subject_path: String,
    /// Subject label.
    pub label: String,
    /// Typed status.
    pub status: AnalysisStatus,
    /// Wire status (`success`, `failure`, ...).
    pub status_message: String,
    /// Diagnostic message.
    pub message: String,
    /// Output paths.
    pub output_paths: Vec<String>,
}

/// Status of a run as seen in its manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    /// Project id.
    pub project_id: String,
    /// Run id.
    pub run_id: String,
    /// Overall status.
    pub status: OutcomeStatus,
    /// Node-level messages, for nodes that have one.
    pub node_messages: Vec<(String, String)>,
    /// Subject states in node order.
    pub subjects: Vec<SubjectStatus>,
}

/// Executes a run and returns its id.
///
/// # Errors
///
/// Propagates every run error; the run's manifest still reflects the last
/// attempted state.
pub async fn submit_run(runner: &PipelineRunner, request: RunRequest) -> Result<String, DerivflowError> {
    runner.run(request).await.map(|report| report.run_id)
}

/// Reads per-node, per-subject status from a run's manifest, optionally
/// restricted to one subject.
///
/// # Errors
///
/// Returns `RunNotFound` if the run does not exist.
pub async fn get_status(
    recorder: &RunRecorder,
    run: &RunKey,
    subject_filter: Option<&Path>,
) -> Result<RunStatus, DerivflowError> {
    let manifest = recorder.load(run).await?;
    let filter = subject_filter.map(canonical_path_string).transpose()?;

    // Graph order first, then outcomes of nodes no longer in the graph.
    let mut node_ids: Vec<&str> = manifest.graph.nodes.iter().map(|n| n.id.as_str()).collect();
    for id in manifest.node_outcomes.keys() {
        if !node_ids.contains(&id.as_str()) {
            node_ids.push(id);
        }
    }

    let mut node_messages = Vec::new();
    let mut subjects = Vec::new();
    for node_id in node_ids {
        let Some(outcome) = manifest.node_outcomes.get(node_id) else {
            continue;
        };
        if !outcome.message.is_empty() {
            node_messages.push((node_id.to_string(), outcome.message.clone()));
        }
        for (label, entries) in &outcome.subjects {
            for entry in entries {
                if filter.as_ref().is_some_and(|f| f != &entry.subject_path) {
                    continue;
                }
                subjects.push(SubjectStatus {
                    node_id: node_id.to_string(),
                    subject_path: entry.subject_path.clone(),
                    label: label.clone(),
                    status: entry.status,
                    status_message: entry.status_message.clone(),
                    message: entry.message.clone(),
                    output_paths: entry.output_paths.clone(),
                });
            }
        }
    }

    Ok(RunStatus {
        project_id: manifest.project_id,
        run_id: manifest.run_id,
        status: manifest.status,
        node_messages,
        subjects,
    })
}
