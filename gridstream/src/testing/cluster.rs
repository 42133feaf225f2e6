//! An in-process cluster for multi-node tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::cluster::{ClusterCompute, ComputeTask, Membership, Transport};
use crate::context::StreamerContext;
use crate::core::NodeId;
use crate::errors::{StreamerError, TransportError};
use crate::pipeline::Pipeline;

#[derive(Default)]
struct ClusterState {
    alive: RwLock<BTreeSet<NodeId>>,
    pipelines: DashMap<(NodeId, String), Weak<Pipeline>>,
    send_failures: DashMap<NodeId, usize>,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

impl ClusterState {
    fn is_alive(&self, node: NodeId) -> bool {
        self.alive.read().contains(&node)
    }

    fn pipeline(&self, node: NodeId, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .get(&(node, name.to_string()))
            .and_then(|p| p.upgrade())
    }

    fn pipeline_on_topic(&self, node: NodeId, topic: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .iter()
            .filter(|e| e.key().0 == node)
            .filter_map(|e| e.value().upgrade())
            .find(|p| p.topic() == topic)
    }
}

/// Several nodes living in one process.
///
/// Messages go through the real codec and are delivered on spawned tasks.
/// Messages to or from departed nodes are dropped.
///
/// ```rust,ignore
/// let cluster = InMemoryCluster::new();
/// let a = cluster.add_node();
/// let pipeline = a.configure(PipelineBuilder::new("p")).stage(..).window(..).build()?;
/// cluster.register(&pipeline);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fresh alive node.
    #[must_use]
    pub fn add_node(&self) -> ClusterNode {
        let node = NodeId::new();
        self.state.alive.write().insert(node);
        ClusterNode {
            node,
            state: self.state.clone(),
        }
    }

    /// Makes a pipeline reachable under its local node and name.
    pub fn register(&self, pipeline: &Arc<Pipeline>) {
        self.state.pipelines.insert(
            (pipeline.local_node(), pipeline.name().to_string()),
            Arc::downgrade(pipeline),
        );
    }

    /// Removes a node and notifies every surviving pipeline.
    pub fn mark_departed(&self, node: NodeId) {
        if !self.state.alive.write().remove(&node) {
            return;
        }
        let survivors: Vec<Arc<Pipeline>> = self
            .state
            .pipelines
            .iter()
            .filter(|e| e.key().0 != node && self.state.is_alive(e.key().0))
            .filter_map(|e| e.value().upgrade())
            .collect();
        for pipeline in survivors {
            pipeline.on_node_left(node);
        }
    }

    /// Makes the next `count` sends to `node` fail with a non-topology error.
    pub fn fail_sends_to(&self, node: NodeId, count: usize) {
        self.state.send_failures.insert(node, count);
    }

    /// Returns the alive nodes.
    #[must_use]
    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.state.alive.read().iter().copied().collect()
    }

    /// Number of messages handed to a pipeline.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.state.delivered.load(Ordering::SeqCst)
    }

    /// Number of messages lost because an endpoint departed.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("alive", &self.state.alive.read().len())
            .field("pipelines", &self.state.pipelines.len())
            .finish_non_exhaustive()
    }
}

/// One node's view of an [`InMemoryCluster`]: its transport, membership and
/// compute collaborators.
#[derive(Clone)]
pub struct ClusterNode {
    node: NodeId,
    state: Arc<ClusterState>,
}

impl ClusterNode {
    /// Returns the node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// Installs this node's collaborators on a builder.
    #[must_use]
    pub fn configure(&self, builder: crate::pipeline::PipelineBuilder) -> crate::pipeline::PipelineBuilder {
        let this = Arc::new(self.clone());
        builder
            .transport(this.clone())
            .membership(this.clone())
            .compute(this)
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode").field("node", &self.node).finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for ClusterNode {
    async fn send(&self, to: NodeId, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.state.is_alive(to) {
            return Err(TransportError::NodeUnreachable(to));
        }
        if !self.state.is_alive(self.node) {
            self.state.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        if let Some(mut remaining) = self.state.send_failures.get_mut(&to) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Send("injected send failure".to_string()));
            }
        }
        let Some(pipeline) = self.state.pipeline_on_topic(to, topic) else {
            return Err(TransportError::NodeUnreachable(to));
        };

        let state = self.state.clone();
        let from = self.node;
        tokio::spawn(async move {
            if state.is_alive(from) && state.is_alive(to) {
                state.delivered.fetch_add(1, Ordering::SeqCst);
                pipeline.on_message(from, &payload);
            } else {
                state.dropped.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(())
    }
}

impl Membership for ClusterNode {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.state.is_alive(node)
    }

    fn projection(&self, pipeline: &str) -> Vec<NodeId> {
        let alive = self.state.alive.read();
        let mut nodes: Vec<NodeId> = self
            .state
            .pipelines
            .iter()
            .filter(|e| e.key().1 == pipeline && alive.contains(&e.key().0))
            .map(|e| e.key().0)
            .collect();
        nodes.sort();
        nodes
    }
}

#[async_trait]
impl ClusterCompute for ClusterNode {
    async fn execute(
        &self,
        origin: &StreamerContext,
        nodes: &[NodeId],
        task: ComputeTask,
    ) -> Result<Vec<serde_json::Value>, StreamerError> {
        let mut contexts: HashMap<NodeId, StreamerContext> = HashMap::new();
        for node in nodes {
            let ctx = if *node == self.node {
                origin.clone()
            } else if self.state.is_alive(*node) {
                self.state
                    .pipeline(*node, origin.pipeline_name())
                    .map(|p| p.context().clone())
                    .ok_or_else(|| {
                        StreamerError::Compute(format!(
                            "pipeline '{}' is not running on node {node}",
                            origin.pipeline_name()
                        ))
                    })?
            } else {
                return Err(StreamerError::Compute(format!("node {node} is unreachable")));
            };
            contexts.insert(*node, ctx);
        }

        nodes
            .iter()
            .filter_map(|node| contexts.get(node))
            .map(|ctx| task(ctx).map_err(|e| StreamerError::Compute(format!("{e:#}"))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_tracks_departures() {
        let cluster = InMemoryCluster::new();
        let a = cluster.add_node();
        let b = cluster.add_node();

        assert!(a.is_alive(b.id()));
        cluster.mark_departed(b.id());

        assert!(!a.is_alive(b.id()));
        assert_eq!(cluster.alive_nodes(), vec![a.id()]);
    }

    #[tokio::test]
    async fn test_send_to_departed_node_is_unreachable() {
        let cluster = InMemoryCluster::new();
        let a = cluster.add_node();
        let b = cluster.add_node();
        cluster.mark_departed(b.id());

        let err = a.send(b.id(), "t", Vec::new()).await.unwrap_err();
        assert_eq!(err, TransportError::NodeUnreachable(b.id()));
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let cluster = InMemoryCluster::new();
        let a = cluster.add_node();
        let b = cluster.add_node();
        cluster.fail_sends_to(b.id(), 1);

        let err = a.send(b.id(), "t", Vec::new()).await.unwrap_err();
        assert!(!err.is_topology());
        // No pipeline is registered on b, so the next send finds nobody.
        let err = a.send(b.id(), "t", Vec::new()).await.unwrap_err();
        assert!(err.is_topology());
    }
}
