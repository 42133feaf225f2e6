//! Event routers.
//!
//! A router partitions the events of one stage hop across the pipeline's node
//! projection. Every event goes to exactly one node; nodes may get nothing.
//!
//! - [`LocalEventRouter`]: keep everything on the local node (default)
//! - [`RoundRobinEventRouter`]: spread events evenly
//! - [`RandomEventRouter`]: pick a random node per event
//! - [`KeyHashEventRouter`]: route by a hashed event key

use crate::core::{Event, NodeId};
use anyhow::bail;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Node-to-events partition produced by a router.
pub type Routes = BTreeMap<NodeId, Vec<Event>>;

/// Decides which node processes each event of a stage hop.
pub trait EventRouter: Send + Sync + Debug {
    /// Partitions `events` across `projection`.
    ///
    /// # Arguments
    ///
    /// * `stage` - The stage the events are headed to
    /// * `events` - The events, in submission order
    /// * `projection` - Candidate nodes, never empty
    /// * `local` - The node doing the routing
    fn route(
        &self,
        stage: &str,
        events: Vec<Event>,
        projection: &[NodeId],
        local: NodeId,
    ) -> anyhow::Result<Routes>;

    /// Called once when the owning pipeline starts.
    fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the owning pipeline stops.
    fn on_stop(&self) {}
}

/// Keeps every event on the local node.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEventRouter;

impl EventRouter for LocalEventRouter {
    fn route(
        &self,
        _stage: &str,
        events: Vec<Event>,
        _projection: &[NodeId],
        local: NodeId,
    ) -> anyhow::Result<Routes> {
        Ok(BTreeMap::from([(local, events)]))
    }
}

/// Assigns events to nodes in turn.
#[derive(Debug, Default)]
pub struct RoundRobinEventRouter {
    next: AtomicUsize,
}

impl RoundRobinEventRouter {
    /// Creates a router starting at the first node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventRouter for RoundRobinEventRouter {
    fn route(
        &self,
        _stage: &str,
        events: Vec<Event>,
        projection: &[NodeId],
        _local: NodeId,
    ) -> anyhow::Result<Routes> {
        if projection.is_empty() {
            bail!("no nodes to route to");
        }
        let mut routes = Routes::new();
        for event in events {
            let slot = self.next.fetch_add(1, Ordering::Relaxed) % projection.len();
            routes.entry(projection[slot]).or_default().push(event);
        }
        Ok(routes)
    }
}

/// Assigns every event to a random node.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomEventRouter;

impl EventRouter for RandomEventRouter {
    fn route(
        &self,
        _stage: &str,
        events: Vec<Event>,
        projection: &[NodeId],
        _local: NodeId,
    ) -> anyhow::Result<Routes> {
        if projection.is_empty() {
            bail!("no nodes to route to");
        }
        let mut rng = rand::thread_rng();
        let mut routes = Routes::new();
        for event in events {
            let node = projection[rng.gen_range(0..projection.len())];
            routes.entry(node).or_default().push(event);
        }
        Ok(routes)
    }
}

type KeyFn = dyn Fn(&Event) -> Option<String> + Send + Sync;

/// Routes events by hashing a key extracted from each event.
///
/// Events sharing a key land on the same node for a given projection. Events
/// without a key stay local.
pub struct KeyHashEventRouter {
    key: Box<KeyFn>,
}

impl KeyHashEventRouter {
    /// Creates a router using a custom key extractor.
    pub fn new<F>(key: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        Self { key: Box::new(key) }
    }

    /// Creates a router keyed by a top-level JSON field.
    #[must_use]
    pub fn by_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |event| {
            event.get(&field).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }

    fn slot(key: &str, nodes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        usize::try_from(hasher.finish() % nodes as u64).unwrap_or(0)
    }
}

impl Debug for KeyHashEventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHashEventRouter").finish_non_exhaustive()
    }
}

impl EventRouter for KeyHashEventRouter {
    fn route(
        &self,
        _stage: &str,
        events: Vec<Event>,
        projection: &[NodeId],
        local: NodeId,
    ) -> anyhow::Result<Routes> {
        if projection.is_empty() {
            bail!("no nodes to route to");
        }
        let mut sorted = projection.to_vec();
        sorted.sort();

        let mut routes = Routes::new();
        for event in events {
            let node = match (self.key)(&event) {
                Some(key) => sorted[Self::slot(&key, sorted.len())],
                None => local,
            };
            routes.entry(node).or_default().push(event);
        }
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|_| NodeId::new()).collect()
    }

    #[test]
    fn test_local_router_keeps_all_events() {
        let local = NodeId::new();
        let routes = LocalEventRouter
            .route("s", vec![json!(1), json!(2)], &nodes(3), local)
            .unwrap();

        assert_eq!(routes.len(), 1);
        assert_eq!(routes[&local], vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_round_robin_spreads_evenly_and_keeps_order() {
        let projection = nodes(2);
        let router = RoundRobinEventRouter::new();
        let routes = router
            .route("s", (0..4).map(|i| json!(i)).collect(), &projection, projection[0])
            .unwrap();

        assert_eq!(routes[&projection[0]], vec![json!(0), json!(2)]);
        assert_eq!(routes[&projection[1]], vec![json!(1), json!(3)]);
    }

    #[test]
    fn test_random_router_assigns_every_event_once() {
        let projection = nodes(3);
        let routes = RandomEventRouter
            .route("s", (0..50).map(|i| json!(i)).collect(), &projection, projection[0])
            .unwrap();

        let total: usize = routes.values().map(Vec::len).sum();
        assert_eq!(total, 50);
        assert!(routes.keys().all(|n| projection.contains(n)));
    }

    #[test]
    fn test_key_hash_router_is_stable_per_key() {
        let projection = nodes(4);
        let router = KeyHashEventRouter::by_field("user");
        let events = vec![
            json!({"user": "a", "n": 1}),
            json!({"user": "b", "n": 2}),
            json!({"user": "a", "n": 3}),
        ];

        let routes = router.route("s", events, &projection, projection[0]).unwrap();

        let holder = routes
            .iter()
            .find(|(_, evts)| evts.iter().any(|e| e["n"] == 1))
            .map(|(node, _)| *node)
            .unwrap();
        assert!(routes[&holder].iter().any(|e| e["n"] == 3));
    }

    #[test]
    fn test_key_hash_router_keeps_keyless_events_local() {
        let projection = nodes(2);
        let local = projection[1];
        let routes = KeyHashEventRouter::by_field("user")
            .route("s", vec![json!(7)], &projection, local)
            .unwrap();
        assert_eq!(routes[&local], vec![json!(7)]);
    }

    #[test]
    fn test_routers_reject_empty_projection() {
        assert!(RoundRobinEventRouter::new()
            .route("s", vec![json!(1)], &[], NodeId::new())
            .is_err());
    }
}
