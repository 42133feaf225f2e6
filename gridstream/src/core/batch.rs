//! The unit of work shipped to one node for one stage hop.

use super::{Event, FutureId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Runs one stage on a group of events as part of a root execution.
///
/// All batches dispatched by one stage future share that future's id; a batch
/// is therefore identified by `(future_id, target node)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBatch {
    /// Id of the root future this batch descends from.
    pub execution_id: FutureId,
    /// Id of the stage future that dispatched this batch.
    pub future_id: FutureId,
    /// Id of the batch whose stage output spawned the dispatching future.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_future_id: Option<FutureId>,
    /// When the root execution started, in milliseconds since the epoch.
    pub execution_start_ts: i64,
    /// Stage to run.
    pub stage_name: String,
    /// Every node that has touched the root execution so far.
    pub execution_node_ids: BTreeSet<NodeId>,
    /// Events in submission order.
    pub events: Vec<Event>,
}

impl ExecutionBatch {
    /// Returns true if this batch belongs to a root future.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_future_id.is_none()
    }

    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the batch carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
