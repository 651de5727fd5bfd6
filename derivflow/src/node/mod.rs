//! Node functions: the opaque per-subject computation of a pipeline node.
//!
//! The engine never looks inside a node function. It hands over the
//! parameters, the subject's named inputs and a fresh output directory, and
//! records whatever paths come back. Failures are plain `anyhow` errors.

mod artifacts;
mod registry;

pub use artifacts::{Artifact, NodeArtifacts, LEDGER_KEY};
pub use registry::{NodeDescriptor, NodeRegistry, RegisteredNode};

use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::SubjectPath;
use crate::skip::ParamFingerprint;

/// Input key carrying the subject's raw input file for root nodes.
pub const SUBJECT_INPUT_KEY: &str = "subject";

/// Everything a node function receives for one subject.
#[derive(Debug, Clone)]
pub struct SubjectInvocation {
    /// Run id.
    pub run_id: String,
    /// Node id.
    pub node_id: String,
    /// Canonical subject path.
    pub subject: SubjectPath,
    /// Subject label.
    pub label: String,
    /// Group tuple, if the subject is grouped.
    pub group: Option<Vec<String>>,
    /// Node parameters.
    pub params: Arc<serde_json::Value>,
    /// Named inputs: the raw subject file for root nodes, otherwise the
    /// subject's outputs of each upstream node keyed by upstream node id.
    pub inputs: NodeArtifacts,
    /// Directory reserved for this subject's outputs; exists and is empty.
    pub output_dir: PathBuf,
}

/// The computation behind a node kind.
#[async_trait]
pub trait NodeFunction: Send + Sync {
    /// Processes one subject and returns its outputs.
    async fn process(&self, invocation: SubjectInvocation) -> anyhow::Result<NodeArtifacts>;

    /// Cache fingerprint of the node's parameters.
    ///
    /// Anything other than [`ParamFingerprint::Default`] disables skipping.
    fn fingerprint(&self, _params: &serde_json::Value) -> ParamFingerprint {
        ParamFingerprint::Default
    }
}

/// A node function backed by an async closure.
pub struct FnNode<F> {
    f: F,
}

/// Wraps an async closure as a [`NodeFunction`].
pub fn from_fn<F, Fut>(f: F) -> FnNode<F>
where
    F: Fn(SubjectInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<NodeArtifacts>> + Send + 'static,
{
    FnNode { f }
}

#[async_trait]
impl<F, Fut> NodeFunction for FnNode<F>
where
    F: Fn(SubjectInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<NodeArtifacts>> + Send + 'static,
{
    async fn process(&self, invocation: SubjectInvocation) -> anyhow::Result<NodeArtifacts> {
        (self.f)(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_fn() {
        let node = from_fn(|inv: SubjectInvocation| async move {
            Ok(NodeArtifacts::new().with_path("out", inv.output_dir.join("x.nii")))
        });
        let inv = SubjectInvocation {
            run_id: "r1".into(),
            node_id: "align".into(),
            subject: SubjectPath::new("/data/sub-01.nii").unwrap(),
            label: "01".into(),
            group: None,
            params: Arc::new(serde_json::Value::Null),
            inputs: NodeArtifacts::new(),
            output_dir: PathBuf::from("/out/sub-01"),
        };

        let out = node.process(inv).await.unwrap();
        assert_eq!(out.output_paths(), vec![PathBuf::from("/out/sub-01/x.nii")]);
        assert!(node.fingerprint(&serde_json::Value::Null).is_default());
    }
}
