//! Pipeline definitions: nodes, parameters and declared dependencies.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::load_document;
use crate::core::NodeKind;
use crate::errors::DerivflowError;
use crate::store::{GraphEdge, GraphNode, RunGraph};

/// One node of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node id; names the node's derivative directory.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Registered node kind.
    pub kind: NodeKind,
    /// Parameters handed to the node function.
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    /// Ids of the nodes this node consumes, in order.
    #[serde(default)]
    pub upstream: Vec<String>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NodeSpec {
    /// Creates a root node spec with empty parameters.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<NodeKind>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: kind.into(),
            params: empty_params(),
            upstream: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Adds upstream nodes.
    #[must_use]
    pub fn after<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream.extend(upstream.into_iter().map(Into::into));
        self
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A pipeline: named set of nodes with declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeSpec>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    /// Loads a definition from a YAML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DerivflowError> {
        load_document(path.as_ref())
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The node graph as recorded in run manifests.
    #[must_use]
    pub fn run_graph(&self) -> RunGraph {
        RunGraph {
            nodes: self
                .nodes
                .iter()
                .map(|n| GraphNode {
                    id: n.id.clone(),
                    name: n.display_name().to_string(),
                    kind: n.kind.to_string(),
                })
                .collect(),
            edges: self
                .nodes
                .iter()
                .flat_map(|n| {
                    n.upstream.iter().map(move |u| GraphEdge {
                        source: u.clone(),
                        target: n.id.clone(),
                    })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_and_graph() {
        let def = PipelineDefinition::new("vbm")
            .node(NodeSpec::new("align", "alignment").with_name("Alignment"))
            .node(NodeSpec::new("seg", "segment1").after(["align"]));

        assert_eq!(def.get("seg").unwrap().display_name(), "seg");
        let graph = def.run_graph();
        assert_eq!(graph.nodes[0].name, "Alignment");
        assert_eq!(graph.edges, vec![GraphEdge { source: "align".into(), target: "seg".into() }]);
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "name: vbm\nnodes:\n  - id: align\n    kind: alignment\n    params:\n      skip_analyzed: true\n  - id: seg\n    kind: segment1\n    upstream: [align]\n",
        )
        .unwrap();

        let def = PipelineDefinition::from_file(&path).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].params, json!({"skip_analyzed": true}));
        assert_eq!(def.nodes[1].params, json!({}));
        assert_eq!(def.nodes[1].upstream, vec!["align"]);
    }
}
