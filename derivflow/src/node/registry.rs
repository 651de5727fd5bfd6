//! Node registry: node kind to function plus declared metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::NodeFunction;
use crate::core::NodeKind;
use crate::errors::DerivflowError;
use crate::executor::SKIP_ANALYZED_PARAM;
use crate::skip::ParamFingerprint;

/// Declared metadata of a node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Kind the descriptor belongs to.
    pub kind: NodeKind,
    /// Human-readable name, used in dataset descriptions.
    pub display_name: String,
    /// Upstream kinds this node may follow; `None` accepts any.
    #[serde(default)]
    pub accepts: Option<Vec<NodeKind>>,
    /// Whether upstream derivative directories must exist and be non-empty.
    #[serde(default = "default_true")]
    pub requires_upstream_derivatives: bool,
    /// Parameters the cached results were produced with. When declared,
    /// any other parameter set disables skipping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_params: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl NodeDescriptor {
    /// Creates a descriptor accepting any upstream kind.
    #[must_use]
    pub fn new(kind: impl Into<NodeKind>) -> Self {
        let kind = kind.into();
        Self {
            display_name: kind.to_string(),
            kind,
            accepts: None,
            requires_upstream_derivatives: true,
            default_params: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Restricts the accepted upstream kinds.
    #[must_use]
    pub fn accepting<I, K>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<NodeKind>,
    {
        self.accepts = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Sets whether upstream derivatives are checked before computing.
    #[must_use]
    pub fn with_upstream_check(mut self, required: bool) -> Self {
        self.requires_upstream_derivatives = required;
        self
    }

    /// Declares the default parameters of the kind.
    #[must_use]
    pub fn with_default_params(mut self, params: serde_json::Value) -> Self {
        self.default_params = Some(params);
        self
    }

    /// Returns true if this node may follow `upstream`.
    #[must_use]
    pub fn accepts_kind(&self, upstream: &NodeKind) -> bool {
        self.accepts
            .as_ref()
            .map_or(true, |kinds| kinds.contains(upstream))
    }
}

/// A registered node kind.
#[derive(Clone)]
pub struct RegisteredNode {
    /// Declared metadata.
    pub descriptor: NodeDescriptor,
    /// The function run per subject.
    pub function: Arc<dyn NodeFunction>,
}

impl RegisteredNode {
    /// Cache fingerprint of `params`.
    ///
    /// A custom fingerprint from the function wins. Otherwise `params` are
    /// compared with the declared defaults, ignoring `skip_analyzed`.
    #[must_use]
    pub fn fingerprint(&self, params: &serde_json::Value) -> ParamFingerprint {
        let own = self.function.fingerprint(params);
        match &self.descriptor.default_params {
            Some(defaults) if own.is_default() => {
                ParamFingerprint::against_defaults(&without_skip_flag(params), &without_skip_flag(defaults))
            }
            _ => own,
        }
    }
}

fn without_skip_flag(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.remove(SKIP_ANALYZED_PARAM);
            serde_json::Value::Object(map)
        }
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    }
}

impl fmt::Debug for RegisteredNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredNode")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Dispatch table from node kind to function. Built once at start-up.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeKind, RegisteredNode>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node kind, replacing any previous registration.
    pub fn register(&mut self, descriptor: NodeDescriptor, function: Arc<dyn NodeFunction>) {
        self.nodes.insert(
            descriptor.kind.clone(),
            RegisteredNode {
                descriptor,
                function,
            },
        );
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_node(mut self, descriptor: NodeDescriptor, function: Arc<dyn NodeFunction>) -> Self {
        self.register(descriptor, function);
        self
    }

    /// Looks up a node kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeKind` if nothing is registered for `kind`.
    pub fn get(&self, kind: &NodeKind) -> Result<&RegisteredNode, DerivflowError> {
        self.nodes
            .get(kind)
            .ok_or_else(|| DerivflowError::UnknownNodeKind(kind.to_string()))
    }

    /// Returns true if `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: &NodeKind) -> bool {
        self.nodes.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&NodeKind> {
        let mut kinds: Vec<_> = self.nodes.keys().collect();
        kinds.sort();
        kinds
    }

    /// Checks that a node of `kind` may follow a node of `upstream_kind`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNodeKind` or `InvalidConnection`.
    pub fn check_connection(
        &self,
        node_id: &str,
        kind: &NodeKind,
        upstream_kind: &NodeKind,
    ) -> Result<(), DerivflowError> {
        let node = self.get(kind)?;
        if node.descriptor.accepts_kind(upstream_kind) {
            Ok(())
        } else {
            Err(DerivflowError::InvalidConnection {
                node_id: node_id.to_string(),
                kind: kind.to_string(),
                upstream_kind: upstream_kind.to_string(),
            })
        }
    }
}
