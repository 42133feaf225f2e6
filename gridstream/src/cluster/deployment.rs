//! Code deployment metadata attached to execution requests.

use crate::core::NodeId;
use anyhow::ensure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use uuid::Uuid;

/// Describes the code a remote node needs to run a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Name of the type whose code is shipped.
    pub type_name: String,
    /// User-assigned version of the deployed code.
    pub user_version: String,
    /// Id of the loader holding the code on the sender.
    pub loader_id: Uuid,
    /// Other nodes known to hold the code, with their loader ids.
    #[serde(default)]
    pub participants: BTreeMap<NodeId, Uuid>,
}

/// Produces and resolves deployment descriptors.
pub trait DeploymentResolver: Send + Sync + Debug {
    /// Returns the descriptor to attach to outgoing requests of a pipeline.
    fn descriptor(&self, pipeline: &str) -> anyhow::Result<DeploymentDescriptor>;

    /// Makes the described code available locally before a batch runs.
    fn resolve(&self, sender: NodeId, descriptor: &DeploymentDescriptor) -> anyhow::Result<()>;
}

/// A resolver for clusters where every node runs the same build.
///
/// Resolution only checks that the sender's user version matches.
#[derive(Debug, Clone)]
pub struct StaticDeploymentResolver {
    type_name: String,
    user_version: String,
    loader_id: Uuid,
}

impl StaticDeploymentResolver {
    /// Creates a resolver for one code version.
    #[must_use]
    pub fn new(type_name: impl Into<String>, user_version: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            user_version: user_version.into(),
            loader_id: Uuid::new_v4(),
        }
    }
}

impl DeploymentResolver for StaticDeploymentResolver {
    fn descriptor(&self, _pipeline: &str) -> anyhow::Result<DeploymentDescriptor> {
        Ok(DeploymentDescriptor {
            type_name: self.type_name.clone(),
            user_version: self.user_version.clone(),
            loader_id: self.loader_id,
            participants: BTreeMap::new(),
        })
    }

    fn resolve(&self, sender: NodeId, descriptor: &DeploymentDescriptor) -> anyhow::Result<()> {
        ensure!(
            descriptor.user_version == self.user_version,
            "node {sender} deployed version '{}' of '{}', local version is '{}'",
            descriptor.user_version,
            descriptor.type_name,
            self.user_version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver_accepts_same_version() {
        let local = StaticDeploymentResolver::new("app", "1.0");
        let remote = StaticDeploymentResolver::new("app", "1.0");

        let descriptor = remote.descriptor("p").unwrap();
        assert!(local.resolve(NodeId::new(), &descriptor).is_ok());
    }

    #[test]
    fn test_static_resolver_rejects_version_mismatch() {
        let local = StaticDeploymentResolver::new("app", "1.0");
        let remote = StaticDeploymentResolver::new("app", "2.0");

        let descriptor = remote.descriptor("p").unwrap();
        let err = local.resolve(NodeId::new(), &descriptor).unwrap_err();
        assert!(err.to_string().contains("2.0"));
    }
}
