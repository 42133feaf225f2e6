//! Error types for the gridstream crate.
//!
//! Three layers are distinguished:
//! - [`ExecutionError`]: the failure cause attached to an execution future. It is
//!   serializable because it travels back to the owning node in responses.
//! - [`TransportError`]: what the messaging collaborator reports.
//! - [`StreamerError`]: what the public pipeline API returns.

use crate::core::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for gridstream operations.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// A caller supplied an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A pipeline configuration is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The pipeline is stopping and refuses new work.
    #[error("Pipeline '{0}' is stopping")]
    Stopping(String),

    /// A message could not be delivered.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// An execution failed.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// An execution was cancelled.
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// A compute task (query, broadcast, reduce) failed.
    #[error("Compute task failed: {0}")]
    Compute(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StreamerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure cause of a stage execution future.
///
/// Only [`ExecutionError::StageFailed`], [`ExecutionError::Topology`] and
/// [`ExecutionError::Stopped`] are recoverable through failover.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// User stage code returned an error.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed {
        /// The failing stage.
        stage: String,
        /// The formatted error chain.
        message: String,
    },

    /// A participating node was unreachable or left the cluster.
    #[error("Node {node} left the cluster before completing the execution")]
    Topology {
        /// The departed node.
        node: NodeId,
    },

    /// The executing node refused the batch because it is stopping.
    #[error("Node {node} is stopping and refused the batch")]
    Stopped {
        /// The stopping node.
        node: NodeId,
    },

    /// Stage configuration differs between nodes, or a stage produced an
    /// invalid routing result.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is misconfigured.
        message: String,
    },

    /// A message could not be delivered and the target is still alive.
    #[error("Failed to send message to node {node}: {message}")]
    Transport {
        /// The target node.
        node: NodeId,
        /// The transport failure.
        message: String,
    },

    /// The router rejected the events.
    #[error("Failed to route events for stage '{stage}': {message}")]
    Routing {
        /// The target stage.
        stage: String,
        /// The router failure.
        message: String,
    },
}

impl ExecutionError {
    /// Creates a stage failure from any displayable error.
    pub fn stage_failed(stage: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: format!("{err:#}"),
        }
    }

    /// Creates the error raised when a batch names a stage the node lacks.
    pub fn unknown_stage(stage: &str, node: NodeId) -> Self {
        Self::Configuration {
            message: format!("stage '{stage}' is not configured on node {node}"),
        }
    }

    /// Returns true if a failover restart may fix the failure.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StageFailed { .. } | Self::Topology { .. } | Self::Stopped { .. }
        )
    }

    /// Returns a short diagnostic tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StageFailed { .. } => "stage_failed",
            Self::Topology { .. } => "topology",
            Self::Stopped { .. } => "stopped",
            Self::Configuration { .. } => "configuration",
            Self::Transport { .. } => "transport",
            Self::Routing { .. } => "routing",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("recoverable".to_string(), serde_json::json!(self.is_recoverable()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Errors reported by the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The destination node is not reachable.
    #[error("Node {0} is unreachable")]
    NodeUnreachable(NodeId),

    /// The message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Any other send failure.
    #[error("Send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// Returns true if the failure is attributable to the destination leaving.
    #[must_use]
    pub fn is_topology(&self) -> bool {
        matches!(self, Self::NodeUnreachable(_))
    }
}

/// Error raised when pipeline configuration validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// Stage or window names involved in the error.
    pub names: Vec<String>,
    /// Hint for fixing the configuration.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            names: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the names involved.
    #[must_use]
    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("names".to_string(), serde_json::json!(self.names));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_recoverable() {
        let node = NodeId::new();
        assert!(ExecutionError::Topology { node }.is_recoverable());
        assert!(ExecutionError::Stopped { node }.is_recoverable());
        assert!(ExecutionError::StageFailed {
            stage: "a".to_string(),
            message: "boom".to_string(),
        }
        .is_recoverable());
        assert!(!ExecutionError::unknown_stage("a", node).is_recoverable());
        assert!(!ExecutionError::Transport {
            node,
            message: "codec".to_string(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_execution_error_serde_tag() {
        let err = ExecutionError::StageFailed {
            stage: "parse".to_string(),
            message: "bad input".to_string(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "stage_failed");

        let back: ExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_stage_failed_keeps_error_chain() {
        let err = anyhow::anyhow!("inner").context("outer");
        let exec = ExecutionError::stage_failed("s", &err);
        assert!(exec.to_string().contains("outer: inner"));
    }

    #[test]
    fn test_execution_error_to_dict() {
        let dict = ExecutionError::Topology { node: NodeId::new() }.to_dict();
        assert_eq!(dict.get("type").unwrap(), "topology");
        assert_eq!(dict.get("recoverable").unwrap(), true);
    }

    #[test]
    fn test_transport_error_is_topology() {
        assert!(TransportError::NodeUnreachable(NodeId::new()).is_topology());
        assert!(!TransportError::Send("x".to_string()).is_topology());
    }

    #[test]
    fn test_pipeline_validation_error_to_dict() {
        let err = PipelineValidationError::new("Duplicate stage names")
            .with_names(vec!["a".to_string()])
            .with_fix_hint("Rename one of the stages");

        let dict = err.to_dict();
        assert_eq!(dict.get("message").unwrap(), "Duplicate stage names");
        assert!(dict.contains_key("fix_hint"));
    }
}
