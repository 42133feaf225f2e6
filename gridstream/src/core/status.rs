//! Execution future status and outcome enums.

use crate::errors::ExecutionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a stage execution future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureStatus {
    /// Created, about to be dispatched to one or more nodes.
    #[default]
    Mapped,
    /// Dispatched; waiting for participating nodes and spawned children.
    AwaitingChildren,
    /// Every participating node acknowledged and every child completed.
    Completed,
    /// A participating node reported an error or left the cluster.
    Failed,
    /// Explicitly cancelled, or cancelled by a failed ancestor.
    Cancelled,
}

impl fmt::Display for FutureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapped => write!(f, "mapped"),
            Self::AwaitingChildren => write!(f, "awaiting_children"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FutureStatus {
    /// Returns true if the status can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-node state of a dispatched batch, as seen by the owning future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    /// The node has not reported yet.
    Pending,
    /// The node reported an error.
    Errored,
    /// The node acknowledged completion.
    Done,
}

/// The terminal result of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The whole execution tree completed.
    Completed,
    /// The execution failed with the given cause.
    Failed(ExecutionError),
    /// The execution was cancelled.
    Cancelled,
}

impl ExecutionOutcome {
    /// Returns true for [`ExecutionOutcome::Completed`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns the failure cause, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the status a future holds once it reached this outcome.
    #[must_use]
    pub fn status(&self) -> FutureStatus {
        match self {
            Self::Completed => FutureStatus::Completed,
            Self::Failed(_) => FutureStatus::Failed,
            Self::Cancelled => FutureStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;

    #[test]
    fn test_future_status_display() {
        assert_eq!(FutureStatus::Mapped.to_string(), "mapped");
        assert_eq!(FutureStatus::AwaitingChildren.to_string(), "awaiting_children");
        assert_eq!(FutureStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_future_status_is_terminal() {
        assert!(FutureStatus::Completed.is_terminal());
        assert!(FutureStatus::Failed.is_terminal());
        assert!(FutureStatus::Cancelled.is_terminal());
        assert!(!FutureStatus::Mapped.is_terminal());
        assert!(!FutureStatus::AwaitingChildren.is_terminal());
    }

    #[test]
    fn test_future_status_serialize() {
        let json = serde_json::to_string(&FutureStatus::AwaitingChildren).unwrap();
        assert_eq!(json, r#""awaiting_children""#);
    }

    #[test]
    fn test_outcome_status() {
        let err = ExecutionError::Topology { node: NodeId::new() };
        assert_eq!(ExecutionOutcome::Completed.status(), FutureStatus::Completed);
        assert_eq!(ExecutionOutcome::Failed(err.clone()).status(), FutureStatus::Failed);
        assert_eq!(ExecutionOutcome::Failed(err.clone()).error(), Some(&err));
        assert!(ExecutionOutcome::Cancelled.error().is_none());
    }
}
