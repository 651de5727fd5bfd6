//! Core domain model types for derivflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Subject identity and its canonicalization
//! - Per-subject status and aggregate outcome status
//! - The per-subject analysis record

mod record;
mod status;
pub(crate) mod subject;

pub use record::AnalysisRecord;
pub use status::{AnalysisStatus, NodeKind, OutcomeStatus};
pub use subject::{SubjectPath, SUBJECT_NAME_PROPERTY};
