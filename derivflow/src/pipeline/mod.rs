//! Pipeline definition, validation and execution.
//!
//! This module provides:
//! - Serializable pipeline definitions
//! - Graph validation (unknown or duplicate ids, cycles, connections)
//! - The runner that executes a pipeline's nodes in dependency order

mod definition;
mod graph;
mod runner;


pub use definition::{NodeSpec, PipelineDefinition};
pub use graph::PipelineGraph;
pub use runner::{PipelineRunner, RunReport, RunRequest};
