//! Completion tracking for one stage hop across the nodes it was routed to.

use super::session::RootSession;
use crate::core::{ChildStatus, ExecutionOutcome, FutureId, FutureStatus, NodeId};
use crate::errors::ExecutionError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct FutureState {
    status: FutureStatus,
    nodes: BTreeMap<NodeId, ChildStatus>,
    error: Option<ExecutionError>,
}

/// Tracks the batches a stage future dispatched and resolves once all of them
/// (and everything they spawned) finished, or as soon as one of them failed.
///
/// Transitions return the terminal outcome exactly once; the caller reacts to
/// it outside the state lock.
#[derive(Debug)]
pub(crate) struct StageExecutionFuture {
    id: FutureId,
    execution_id: FutureId,
    parent_id: Option<FutureId>,
    stage: String,
    start_ts: i64,
    attempt: usize,
    session: Option<Arc<RootSession>>,
    state: Mutex<FutureState>,
    outcome: watch::Sender<Option<ExecutionOutcome>>,
}

impl StageExecutionFuture {
    fn new(
        id: FutureId,
        execution_id: FutureId,
        parent_id: Option<FutureId>,
        stage: String,
        start_ts: i64,
        attempt: usize,
        session: Option<Arc<RootSession>>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            execution_id,
            parent_id,
            stage,
            start_ts,
            attempt,
            session,
            state: Mutex::new(FutureState::default()),
            outcome,
        }
    }

    /// A root future is its own execution.
    pub(crate) fn root(id: FutureId, session: Arc<RootSession>, start_ts: i64, attempt: usize) -> Self {
        let stage = session.stage().to_string();
        Self::new(id, id, None, stage, start_ts, attempt, Some(session))
    }

    pub(crate) fn child(
        id: FutureId,
        execution_id: FutureId,
        parent_id: FutureId,
        stage: String,
        start_ts: i64,
    ) -> Self {
        Self::new(id, execution_id, Some(parent_id), stage, start_ts, 0, None)
    }

    pub(crate) fn id(&self) -> FutureId {
        self.id
    }

    pub(crate) fn execution_id(&self) -> FutureId {
        self.execution_id
    }

    pub(crate) fn parent_id(&self) -> Option<FutureId> {
        self.parent_id
    }

    pub(crate) fn stage(&self) -> &str {
        &self.stage
    }

    pub(crate) fn start_ts(&self) -> i64 {
        self.start_ts
    }

    /// Failover attempt this root belongs to; 0 for the first run and for
    /// children.
    pub(crate) fn attempt(&self) -> usize {
        self.attempt
    }

    pub(crate) fn session(&self) -> Option<&Arc<RootSession>> {
        self.session.as_ref()
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub(crate) fn status(&self) -> FutureStatus {
        self.state.lock().status
    }

    #[cfg(test)]
    pub(crate) fn error(&self) -> Option<ExecutionError> {
        self.state.lock().error.clone()
    }

    /// Records the nodes batches are about to be sent to.
    pub(crate) fn mapped(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        for node in nodes {
            state.nodes.insert(node, ChildStatus::Pending);
        }
        state.status = FutureStatus::AwaitingChildren;
    }

    /// Nodes that have not reported yet.
    pub(crate) fn pending_nodes(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .nodes
            .iter()
            .filter(|(_, status)| **status == ChildStatus::Pending)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Applies a node's completion report. Reports from nodes the future did
    /// not dispatch to, and duplicate reports, are ignored.
    pub(crate) fn on_execution_completed(
        &self,
        node: NodeId,
        error: Option<ExecutionError>,
    ) -> Option<ExecutionOutcome> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        let entry = state.nodes.get_mut(&node)?;
        if *entry != ChildStatus::Pending {
            return None;
        }

        if let Some(error) = error {
            *entry = ChildStatus::Errored;
            return Some(self.finish(&mut state, ExecutionOutcome::Failed(error)));
        }

        *entry = ChildStatus::Done;
        if state.nodes.values().all(|s| *s == ChildStatus::Done) {
            return Some(self.finish(&mut state, ExecutionOutcome::Completed));
        }
        None
    }

    /// Fails the future if `node` still owes it a report.
    pub(crate) fn on_node_left(&self, node: NodeId) -> Option<ExecutionOutcome> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        let entry = state.nodes.get_mut(&node)?;
        if *entry != ChildStatus::Pending {
            return None;
        }
        *entry = ChildStatus::Errored;
        Some(self.finish(&mut state, ExecutionOutcome::Failed(ExecutionError::Topology { node })))
    }

    pub(crate) fn fail(&self, error: ExecutionError) -> Option<ExecutionOutcome> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        Some(self.finish(&mut state, ExecutionOutcome::Failed(error)))
    }

    pub(crate) fn cancel(&self) -> Option<ExecutionOutcome> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return None;
        }
        Some(self.finish(&mut state, ExecutionOutcome::Cancelled))
    }

    fn finish(&self, state: &mut FutureState, outcome: ExecutionOutcome) -> ExecutionOutcome {
        state.status = outcome.status();
        state.error = outcome.error().cloned();
        self.outcome.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Resolves with the terminal outcome.
    pub(crate) async fn wait(&self) -> ExecutionOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
        outcome.unwrap_or(ExecutionOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn child(nodes: &[NodeId]) -> StageExecutionFuture {
        let owner = NodeId::new();
        let fut = StageExecutionFuture::child(
            FutureId::new(owner, 2),
            FutureId::new(owner, 1),
            FutureId::new(owner, 1),
            "s".to_string(),
            0,
        );
        fut.mapped(nodes.iter().copied());
        fut
    }

    #[test]
    fn test_completes_when_all_nodes_report() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let fut = child(&[a, b]);
        assert_eq!(fut.status(), FutureStatus::AwaitingChildren);

        assert_eq!(fut.on_execution_completed(a, None), None);
        assert_eq!(fut.on_execution_completed(a, None), None);
        assert_eq!(fut.pending_nodes(), vec![b]);
        assert_eq!(fut.on_execution_completed(b, None), Some(ExecutionOutcome::Completed));
        assert_eq!(fut.status(), FutureStatus::Completed);
    }

    #[test]
    fn test_first_error_fails_future() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let fut = child(&[a, b]);
        let err = ExecutionError::Configuration {
            message: "x".to_string(),
        };

        let outcome = fut.on_execution_completed(a, Some(err.clone()));

        assert_eq!(outcome, Some(ExecutionOutcome::Failed(err.clone())));
        assert_eq!(fut.error(), Some(err));
        assert_eq!(fut.pending_nodes(), vec![b]);
        assert_eq!(fut.on_execution_completed(b, None), None);
    }

    #[test]
    fn test_reports_from_unknown_nodes_are_ignored() {
        let fut = child(&[NodeId::new()]);
        assert_eq!(fut.on_execution_completed(NodeId::new(), None), None);
        assert_eq!(fut.status(), FutureStatus::AwaitingChildren);
    }

    #[test]
    fn test_node_left_fails_only_pending_nodes() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let fut = child(&[a, b]);
        fut.on_execution_completed(a, None);

        assert_eq!(fut.on_node_left(a), None);
        assert_eq!(
            fut.on_node_left(b),
            Some(ExecutionOutcome::Failed(ExecutionError::Topology { node: b }))
        );
    }

    #[test]
    fn test_late_report_after_node_left_is_ignored() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let fut = child(&[a, b]);
        let failed = ExecutionOutcome::Failed(ExecutionError::Topology { node: b });
        assert_eq!(fut.on_node_left(b), Some(failed.clone()));

        assert_eq!(fut.on_execution_completed(b, None), None);
        assert_eq!(fut.on_execution_completed(a, None), None);
        assert_eq!(fut.status(), FutureStatus::Failed);
        assert_eq!(fut.error(), Some(ExecutionError::Topology { node: b }));
    }

    #[test]
    fn test_node_left_does_not_touch_completed_future() {
        let a = NodeId::new();
        let fut = child(&[a]);
        fut.on_execution_completed(a, None);

        assert_eq!(fut.on_node_left(a), None);
        assert_eq!(fut.status(), FutureStatus::Completed);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let fut = child(&[NodeId::new()]);
        assert_eq!(fut.cancel(), Some(ExecutionOutcome::Cancelled));
        assert_eq!(fut.cancel(), None);
        assert_eq!(fut.fail(ExecutionError::Topology { node: NodeId::new() }), None);
        assert_eq!(fut.status(), FutureStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_completion() {
        let a = NodeId::new();
        let fut = Arc::new(child(&[a]));
        let waiter = {
            let fut = fut.clone();
            tokio::spawn(async move { fut.wait().await })
        };

        fut.on_execution_completed(a, None);

        assert_eq!(waiter.await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(fut.wait().await, ExecutionOutcome::Completed);
    }
}
