//! Validation and ordering of a pipeline definition.

use std::collections::{HashMap, HashSet};

use super::{NodeSpec, PipelineDefinition};
use crate::errors::{CycleDetectedError, DerivflowError, PipelineValidationError};
use crate::node::NodeRegistry;

/// A validated pipeline with its execution order.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    definition: PipelineDefinition,
    index: HashMap<String, usize>,
    execution_order: Vec<String>,
}

impl PipelineGraph {
    /// Validates structure: at least one node, unique ids, known upstream
    /// ids and no cycles.
    ///
    /// # Errors
    ///
    /// Returns `Validation` or `CycleDetected`.
    pub fn build(definition: PipelineDefinition) -> Result<Self, DerivflowError> {
        if definition.nodes.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no nodes")
                .with_fix_hint("Add at least one node to the pipeline definition.")
                .into());
        }

        let mut index = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(PipelineValidationError::new(format!("Duplicate node id '{}'", node.id))
                    .with_nodes(vec![node.id.clone()])
                    .into());
            }
        }

        for node in &definition.nodes {
            for dep in &node.upstream {
                if !index.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Node '{}' depends on unknown node '{}'",
                        node.id, dep
                    ))
                    .with_nodes(vec![node.id.clone(), dep.clone()])
                    .with_fix_hint("Declare the upstream node or remove the dependency.")
                    .into());
                }
                if dep == &node.id {
                    return Err(CycleDetectedError::new(vec![node.id.clone(), node.id.clone()]).into());
                }
            }
        }

        let graph = Self {
            execution_order: Vec::new(),
            index,
            definition,
        };
        graph.detect_cycles()?;
        let execution_order = graph.topological_order();
        Ok(Self {
            execution_order,
            ..graph
        })
    }

    /// Checks that every node kind is registered and accepts its upstream kinds.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeKind` or `InvalidConnection`.
    pub fn check_connections(&self, registry: &NodeRegistry) -> Result<(), DerivflowError> {
        for node in &self.definition.nodes {
            registry.get(&node.kind)?;
            for dep in &node.upstream {
                let upstream = self.node(dep)?;
                registry.check_connection(&node.id, &node.kind, &upstream.kind)?;
            }
        }
        Ok(())
    }

    /// The definition.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Node ids in dependency order; ties follow declaration order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a node.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the id is unknown.
    pub fn node(&self, id: &str) -> Result<&NodeSpec, DerivflowError> {
        self.index
            .get(id)
            .map(|&i| &self.definition.nodes[i])
            .ok_or_else(|| PipelineValidationError::new(format!("Unknown node '{id}'")).into())
    }

    /// Every node that transitively depends on `id`.
    #[must_use]
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut found: HashSet<String> = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for node in &self.definition.nodes {
                if node.upstream.contains(&current) && found.insert(node.id.clone()) {
                    frontier.push(node.id.clone());
                }
            }
        }
        found
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for node in &self.definition.nodes {
            if !visited.contains(node.id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(&node.id, &mut visited, &mut on_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        on_stack.insert(id);
        path.push(id);

        if let Some(&i) = self.index.get(id) {
            for dep in &self.definition.nodes[i].upstream {
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, on_stack, path) {
                        return Some(cycle);
                    }
                } else if on_stack.contains(dep.as_str()) {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(id);
        None
    }

    fn topological_order(&self) -> Vec<String> {
        fn visit<'a>(
            graph: &'a PipelineGraph,
            id: &'a str,
            visited: &mut HashSet<&'a str>,
            order: &mut Vec<String>,
        ) {
            if !visited.insert(id) {
                return;
            }
            if let Some(&i) = graph.index.get(id) {
                for dep in &graph.definition.nodes[i].upstream {
                    visit(graph, dep, visited, order);
                }
            }
            order.push(id.to_string());
        }

        let mut order = Vec::with_capacity(self.definition.nodes.len());
        let mut visited = HashSet::new();
        for node in &self.definition.nodes {
            visit(self, &node.id, &mut visited, &mut order);
        }
        order
    }
}
