//! Cluster collaborators consumed by a pipeline.
//!
//! The pipeline does not implement discovery, messaging or remote compute
//! itself. The embedding application supplies:
//! - [`Transport`]: point-to-point delivery on a topic
//! - [`Membership`]: the local node, liveness and the pipeline projection
//! - [`ClusterCompute`]: runs query tasks against remote pipeline contexts
//! - [`DeploymentResolver`]: code deployment metadata for peer deployment
//!
//! Inbound messages are handed to `Pipeline::on_message` and node departures
//! to `Pipeline::on_node_left`.

mod deployment;
mod message;

pub use deployment::{DeploymentDescriptor, DeploymentResolver, StaticDeploymentResolver};
pub use message::{pipeline_topic, StreamerMessage};

use crate::context::StreamerContext;
use crate::core::NodeId;
use crate::errors::{StreamerError, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

/// Point-to-point message delivery.
///
/// Delivery is at-most-once per call; the pipeline retries on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends an encoded message to a node.
    ///
    /// Returns [`TransportError::NodeUnreachable`] if the destination is not
    /// part of the cluster.
    async fn send(&self, to: NodeId, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Cluster membership as seen from the local node.
#[cfg_attr(test, mockall::automock)]
pub trait Membership: Send + Sync {
    /// Returns the id of the local node.
    fn local_node(&self) -> NodeId;

    /// Returns true if the node is currently reachable.
    fn is_alive(&self, node: NodeId) -> bool;

    /// Returns the alive nodes running a pipeline with this name.
    fn projection(&self, pipeline: &str) -> Vec<NodeId>;
}

/// A task run against a node's pipeline context. Results cross node
/// boundaries as JSON.
pub type ComputeTask = Arc<dyn Fn(&StreamerContext) -> anyhow::Result<serde_json::Value> + Send + Sync>;

/// Runs query tasks on a set of nodes.
#[async_trait]
pub trait ClusterCompute: Send + Sync {
    /// Runs `task` on every node in `nodes` against the same-named pipeline
    /// and returns one result per node.
    async fn execute(
        &self,
        origin: &StreamerContext,
        nodes: &[NodeId],
        task: ComputeTask,
    ) -> Result<Vec<serde_json::Value>, StreamerError>;
}

/// Runs query tasks on the local node only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCompute;

#[async_trait]
impl ClusterCompute for LocalCompute {
    async fn execute(
        &self,
        origin: &StreamerContext,
        nodes: &[NodeId],
        task: ComputeTask,
    ) -> Result<Vec<serde_json::Value>, StreamerError> {
        let local = origin.local_node();
        if let Some(remote) = nodes.iter().find(|n| **n != local) {
            return Err(StreamerError::Compute(format!(
                "node {remote} is not reachable from local compute"
            )));
        }
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        task(origin)
            .map(|value| vec![value])
            .map_err(|e| StreamerError::Compute(format!("{e:#}")))
    }
}

/// Membership of a single-node cluster.
#[derive(Debug, Clone, Copy)]
pub struct StandaloneMembership {
    node: NodeId,
}

impl StandaloneMembership {
    /// Creates a membership view with a fresh local node id.
    #[must_use]
    pub fn new() -> Self {
        Self { node: NodeId::new() }
    }
}

impl Default for StandaloneMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership for StandaloneMembership {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn is_alive(&self, node: NodeId) -> bool {
        node == self.node
    }

    fn projection(&self, _pipeline: &str) -> Vec<NodeId> {
        vec![self.node]
    }
}

/// Transport of a single-node cluster: every send fails as unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn send(&self, to: NodeId, _topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::NodeUnreachable(to))
    }
}
