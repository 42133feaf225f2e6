//! Messages exchanged between pipeline instances on different nodes.
//!
//! All messages travel on the pipeline's dedicated topic and are correlated
//! purely by future id. The codec is JSON.

use super::DeploymentDescriptor;
use crate::core::{ExecutionBatch, FutureId};
use crate::errors::{ExecutionError, TransportError};
use serde::{Deserialize, Serialize};

/// Returns the topic a pipeline listens on.
#[must_use]
pub fn pipeline_topic(pipeline: &str) -> String {
    format!("gridstream.pipeline.{pipeline}")
}

/// A pipeline protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamerMessage {
    /// Run a batch on the receiving node.
    ExecutionRequest {
        /// The batch to run.
        batch: ExecutionBatch,
        /// Code deployment metadata, when peer deployment is enabled.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment: Option<DeploymentDescriptor>,
    },
    /// Cancel the local batch with this future id, if any.
    CancelRequest {
        /// Future id of the batch to cancel.
        future_id: FutureId,
    },
    /// A batch finished; addressed to the node owning `future_id`.
    Response {
        /// Future id of the completed batch.
        future_id: FutureId,
        /// The failure cause, absent on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ExecutionError>,
    },
}

impl StreamerMessage {
    /// Returns the correlation id carried by the message.
    #[must_use]
    pub fn future_id(&self) -> FutureId {
        match self {
            Self::ExecutionRequest { batch, .. } => batch.future_id,
            Self::CancelRequest { future_id } | Self::Response { future_id, .. } => *future_id,
        }
    }

    /// Returns a short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionRequest { .. } => "execution_request",
            Self::CancelRequest { .. } => "cancel_request",
            Self::Response { .. } => "response",
        }
    }

    /// Serializes the message.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Deserializes a message.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn test_execution_request_carries_batch() {
        let node = NodeId::new();
        let id = FutureId::new(node, 3);
        let batch = ExecutionBatch {
            execution_id: id,
            future_id: id,
            parent_future_id: None,
            execution_start_ts: 42,
            stage_name: "parse".to_string(),
            execution_node_ids: BTreeSet::from([node]),
            events: vec![json!({"k": 1})],
        };
        let msg = StreamerMessage::ExecutionRequest {
            batch: batch.clone(),
            deployment: None,
        };

        let decoded = StreamerMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.future_id(), id);
        assert_eq!(decoded.kind(), "execution_request");
    }

    #[test]
    fn test_response_error_is_tagged() {
        let node = NodeId::new();
        let msg = StreamerMessage::Response {
            future_id: FutureId::new(node, 1),
            error: Some(ExecutionError::Topology { node }),
        };

        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["error"]["kind"], "topology");
    }

    #[test]
    fn test_successful_response_omits_error() {
        let msg = StreamerMessage::Response {
            future_id: FutureId::new(NodeId::new(), 1),
            error: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = StreamerMessage::decode(b"not json").unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[test]
    fn test_topic_is_per_pipeline() {
        assert_ne!(pipeline_topic("a"), pipeline_topic("b"));
    }
}
