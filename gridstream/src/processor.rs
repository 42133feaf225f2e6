//! Registry of the pipelines running on one node.

use crate::core::NodeId;
use crate::errors::{PipelineValidationError, StreamerError};
use crate::pipeline::Pipeline;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The configuration a node advertises for each of its pipelines, so that
/// joining nodes can be checked for compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineAttributes {
    /// Pipeline name.
    pub name: String,
    /// At-least-once flag.
    pub at_least_once: bool,
    /// Stage names in configuration order.
    pub stages: Vec<String>,
    /// Failover restarts per root execution.
    pub max_failover_attempts: usize,
    /// Concurrent root execution bound.
    pub max_concurrent_sessions: usize,
}

impl PipelineAttributes {
    /// Captures the attributes of a pipeline.
    #[must_use]
    pub fn of(pipeline: &Pipeline) -> Self {
        let config = pipeline.config();
        Self {
            name: config.name.clone(),
            at_least_once: config.at_least_once,
            stages: pipeline.stage_names().to_vec(),
            max_failover_attempts: config.max_failover_attempts,
            max_concurrent_sessions: config.max_concurrent_sessions,
        }
    }

    /// Checks a remote pipeline with the same name against this one.
    ///
    /// Differing failover or session limits are only logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the at-least-once flags or the stage lists differ.
    pub fn check_compatible(&self, remote: &Self, remote_node: NodeId) -> Result<(), PipelineValidationError> {
        if self.at_least_once != remote.at_least_once {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' at_least_once mismatch: local={}, remote={} on node {remote_node}",
                self.name, self.at_least_once, remote.at_least_once
            ))
            .with_names(vec![self.name.clone()])
            .with_fix_hint("Use the same at_least_once flag on every node."));
        }
        if self.stages != remote.stages {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' stages mismatch: local={:?}, remote={:?} on node {remote_node}",
                self.name, self.stages, remote.stages
            ))
            .with_names(self.stages.clone())
            .with_fix_hint("Configure identical stage lists on every node."));
        }
        if remote.at_least_once {
            if self.max_failover_attempts != remote.max_failover_attempts {
                warn!(
                    pipeline = %self.name,
                    node_id = %remote_node,
                    local = self.max_failover_attempts,
                    remote = remote.max_failover_attempts,
                    "max_failover_attempts differs between nodes"
                );
            }
            if self.max_concurrent_sessions != remote.max_concurrent_sessions {
                warn!(
                    pipeline = %self.name,
                    node_id = %remote_node,
                    local = self.max_concurrent_sessions,
                    remote = remote.max_concurrent_sessions,
                    "max_concurrent_sessions differs between nodes"
                );
            }
        }
        Ok(())
    }
}

/// Starts, looks up and stops the pipelines of one node.
#[derive(Debug, Default)]
pub struct StreamProcessor {
    pipelines: RwLock<BTreeMap<String, Arc<Pipeline>>>,
}

impl StreamProcessor {
    /// Creates an empty processor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a pipeline and registers it under its name.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::InvalidArgument`] for a duplicate name, or the
    /// error of a failing start hook.
    pub fn add(&self, pipeline: Arc<Pipeline>) -> Result<(), StreamerError> {
        let name = pipeline.name().to_string();
        if self.pipelines.read().contains_key(&name) {
            return Err(StreamerError::InvalidArgument(format!(
                "duplicate pipeline name '{name}'"
            )));
        }
        pipeline.start()?;

        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&name) {
            return Err(StreamerError::InvalidArgument(format!(
                "duplicate pipeline name '{name}'"
            )));
        }
        pipelines.insert(name, pipeline);
        Ok(())
    }

    /// Returns a pipeline by name.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::InvalidArgument`] if no such pipeline runs here.
    pub fn get(&self, name: &str) -> Result<Arc<Pipeline>, StreamerError> {
        self.pipelines
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StreamerError::InvalidArgument(format!("pipeline '{name}' is not configured")))
    }

    /// Returns every registered pipeline, ordered by name.
    #[must_use]
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.read().values().cloned().collect()
    }

    /// Returns the attributes advertised by this node.
    #[must_use]
    pub fn attributes(&self) -> Vec<PipelineAttributes> {
        self.pipelines
            .read()
            .values()
            .map(|p| PipelineAttributes::of(p))
            .collect()
    }

    /// Checks a joining node's pipelines against the local ones.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::Validation`] on the first incompatible
    /// same-named pipeline.
    pub fn check_remote_node(&self, remote_node: NodeId, remote: &[PipelineAttributes]) -> Result<(), StreamerError> {
        let local = self.attributes();
        for rmt in remote {
            if let Some(loc) = local.iter().find(|l| l.name == rmt.name) {
                loc.check_compatible(rmt, remote_node)?;
            }
        }
        Ok(())
    }

    /// Forwards a node departure to every pipeline.
    pub fn on_node_left(&self, node: NodeId) {
        for pipeline in self.pipelines() {
            pipeline.on_node_left(node);
        }
    }

    /// Stops every pipeline and clears the registry.
    pub async fn stop_all(&self, cancel: bool) {
        let pipelines: Vec<Arc<Pipeline>> = std::mem::take(&mut *self.pipelines.write()).into_values().collect();
        for pipeline in pipelines {
            pipeline.stop(cancel).await;
        }
        info!(cancel, "Stream processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::NoOpStage;
    use crate::window::UnboundedWindow;

    fn attrs(at_least_once: bool, stages: &[&str], failover: usize) -> PipelineAttributes {
        PipelineAttributes {
            name: "p".to_string(),
            at_least_once,
            stages: stages.iter().map(|s| (*s).to_string()).collect(),
            max_failover_attempts: failover,
            max_concurrent_sessions: 0,
        }
    }

    fn pipeline(name: &str) -> Arc<Pipeline> {
        PipelineBuilder::new(name)
            .stage(NoOpStage::new("a"))
            .window(UnboundedWindow::new("w"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_compatible_attributes() {
        let node = NodeId::new();
        let local = attrs(true, &["a", "b"], 3);

        assert!(local.check_compatible(&attrs(true, &["a", "b"], 5), node).is_ok());
        assert!(local.check_compatible(&attrs(false, &["a", "b"], 3), node).is_err());
        assert!(local.check_compatible(&attrs(true, &["b", "a"], 3), node).is_err());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let processor = StreamProcessor::new();
        processor.add(pipeline("p")).unwrap();

        assert!(matches!(
            processor.add(pipeline("p")),
            Err(StreamerError::InvalidArgument(_))
        ));
        assert!(processor.get("p").is_ok());
        assert!(processor.get("q").is_err());
    }

    #[tokio::test]
    async fn test_check_remote_node_ignores_unknown_pipelines() {
        let processor = StreamProcessor::new();
        processor.add(pipeline("p")).unwrap();
        let node = NodeId::new();

        let mut other = attrs(true, &["x"], 3);
        other.name = "other".to_string();
        assert!(processor.check_remote_node(node, &[other]).is_ok());
        assert!(matches!(
            processor.check_remote_node(node, &[attrs(true, &["a"], 3)]),
            Err(StreamerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_clears_registry() {
        let processor = StreamProcessor::new();
        let p = pipeline("p");
        processor.add(p.clone()).unwrap();

        processor.stop_all(false).await;

        assert!(processor.pipelines().is_empty());
        assert!(p.is_stopping());
    }
}
