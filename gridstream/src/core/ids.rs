//! Node and future identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identifies a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Creates a random node id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique id of a stage execution future.
///
/// The id embeds the node that owns the future, so completion responses can be
/// addressed without any lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FutureId {
    node: NodeId,
    seq: u64,
}

impl FutureId {
    /// Creates a future id from its parts.
    #[must_use]
    pub fn new(node: NodeId, seq: u64) -> Self {
        Self { node, seq }
    }

    /// Returns the node that owns the future.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the node-local sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.seq, self.node)
    }
}

/// Hands out future ids owned by one node.
#[derive(Debug)]
pub struct FutureIdGenerator {
    node: NodeId,
    next: AtomicU64,
}

impl FutureIdGenerator {
    /// Creates a generator for the given node.
    #[must_use]
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unused id.
    pub fn next_id(&self) -> FutureId {
        FutureId::new(self.node, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generator_ids_are_unique_and_owned() {
        let node = NodeId::new();
        let gen = FutureIdGenerator::new(node);

        let ids: HashSet<FutureId> = (0..100).map(|_| gen.next_id()).collect();

        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.node() == node));
    }

    #[test]
    fn test_future_id_display() {
        let node = NodeId::new();
        let id = FutureId::new(node, 7);
        assert_eq!(id.to_string(), format!("7@{node}"));
    }

    #[test]
    fn test_node_id_serializes_as_uuid() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_string(&NodeId::from_uuid(uuid)).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }
}
