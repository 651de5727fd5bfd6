//! # Derivflow
//!
//! Incremental, resumable execution of per-subject analysis pipelines.
//!
//! A pipeline is a graph of nodes. Each node runs an opaque function once per
//! subject file and writes its derivatives below the project root. Derivflow
//! provides:
//!
//! - **Per-subject tracking**: an analysis ledger records status, timing and
//!   outputs of every subject in every node
//! - **Skip on rerun**: a resume index lets later runs reuse results whose
//!   outputs still exist
//! - **Failure isolation**: a subject failing never stops the node; a node
//!   failing for every subject halts the run
//! - **Durable run records**: a run manifest that always reflects the last
//!   attempted state
//! - **Derivative collection**: subject directories a run no longer produces
//!   are removed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use derivflow::prelude::*;
//!
//! let registry = NodeRegistry::new()
//!     .with_node(NodeDescriptor::new("alignment"), Arc::new(from_fn(align)));
//! let runner = PipelineRunner::new(EngineConfig::new(), registry);
//!
//! let definition = PipelineDefinition::new("vbm")
//!     .node(NodeSpec::new("align", "alignment").with_params(json!({"skip_analyzed": true})));
//! let request = RunRequest::new("study", "/data/study", definition).with_subjects(subjects);
//! let report = runner.run(request).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gc;
pub mod ledger;
pub mod node;
pub mod pipeline;
pub mod recorder;
pub mod skip;
pub mod store;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{get_status, submit_run, RunStatus, SubjectStatus};
    pub use crate::config::EngineConfig;
    pub use crate::core::{AnalysisRecord, AnalysisStatus, NodeKind, OutcomeStatus, SubjectPath};
    pub use crate::errors::{
        CycleDetectedError, DerivflowError, FailureDetail, PipelineValidationError,
    };
    pub use crate::events::{
        CollectingEventSink, EngineEvent, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::ledger::AnalysisLedger;
    pub use crate::node::{
        from_fn, Artifact, NodeArtifacts, NodeDescriptor, NodeFunction, NodeRegistry,
        SubjectInvocation,
    };
    pub use crate::pipeline::{
        NodeSpec, PipelineDefinition, PipelineGraph, PipelineRunner, RunReport, RunRequest,
    };
    pub use crate::recorder::RunRecorder;
    pub use crate::skip::{should_skip, ParamFingerprint, SkipPolicy};
    pub use crate::store::{ArtifactStore, ManifestStore, ResumeStore, RunKey, RunManifest};
}
