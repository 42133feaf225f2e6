//! Root submissions and the handles returned to callers.

use super::Pipeline;
use crate::core::{Event, ExecutionOutcome, FutureId};
use crate::errors::{ExecutionError, StreamerError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, OwnedSemaphorePermit};

/// Identifies a registered failure listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Receives `(stage, events, error)` for every execution that failed for good.
pub type FailureListener = Arc<dyn Fn(&str, &[Event], &ExecutionError) + Send + Sync>;

/// One root submission across all of its failover attempts.
///
/// Holds the admission permit for the whole retry chain and resolves once.
#[derive(Debug)]
pub(crate) struct RootSession {
    stage: String,
    events: Vec<Event>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    attempts: AtomicUsize,
    current: Mutex<Option<FutureId>>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    outcome: watch::Sender<Option<ExecutionOutcome>>,
}

impl RootSession {
    pub(crate) fn new(stage: impl Into<String>, events: Vec<Event>, permit: Option<OwnedSemaphorePermit>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            stage: stage.into(),
            events,
            permit: Mutex::new(permit),
            attempts: AtomicUsize::new(0),
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            outcome,
        }
    }

    pub(crate) fn stage(&self) -> &str {
        &self.stage
    }

    pub(crate) fn events(&self) -> &[Event] {
        &self.events
    }

    /// Registers a new attempt and returns its index.
    pub(crate) fn begin_attempt(&self, root: FutureId) -> usize {
        *self.current.lock() = Some(root);
        self.attempts.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn current(&self) -> Option<FutureId> {
        *self.current.lock()
    }

    /// Returns false if cancellation was already requested.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true for the first caller only.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Drops the admission permit, if one is still held.
    pub(crate) fn release_permit(&self) -> bool {
        self.permit.lock().take().is_some()
    }

    pub(crate) fn publish(&self, outcome: ExecutionOutcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub(crate) fn outcome(&self) -> Option<ExecutionOutcome> {
        self.outcome.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> ExecutionOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
        outcome.unwrap_or(ExecutionOutcome::Cancelled)
    }
}

/// Handle to a submitted root execution.
///
/// Dropping the handle does not cancel the execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    session: Arc<RootSession>,
    pipeline: Weak<Pipeline>,
}

impl ExecutionHandle {
    pub(crate) fn new(session: Arc<RootSession>, pipeline: Weak<Pipeline>) -> Self {
        Self { session, pipeline }
    }

    /// Waits until the execution completed, failed for good, or was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::Execution`] with the final failure cause, or
    /// [`StreamerError::Cancelled`].
    pub async fn wait(&self) -> Result<(), StreamerError> {
        match self.session.wait().await {
            ExecutionOutcome::Completed => Ok(()),
            ExecutionOutcome::Failed(err) => Err(StreamerError::Execution(err)),
            ExecutionOutcome::Cancelled => Err(StreamerError::Cancelled(format!(
                "execution of stage '{}' was cancelled",
                self.session.stage()
            ))),
        }
    }

    /// Returns the final outcome if the execution already finished.
    #[must_use]
    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        self.session.outcome()
    }

    /// Returns true once the execution reached its final outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.session.is_finished()
    }

    /// Cancels the execution. A no-op once it finished.
    pub fn cancel(&self) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.cancel_session(&self.session);
        }
    }

    /// Number of attempts started so far, the first run included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.session.attempts()
    }

    /// Id of the root future of the current attempt.
    #[must_use]
    pub fn execution_id(&self) -> Option<FutureId> {
        self.session.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;
    use serde_json::json;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_permit_released_once() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let session = RootSession::new("s", vec![json!(1)], Some(permit));
        assert_eq!(semaphore.available_permits(), 0);

        assert!(session.release_permit());
        assert!(!session.release_permit());
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_attempts_and_flags() {
        let node = NodeId::new();
        let session = RootSession::new("s", vec![json!(1)], None);

        assert_eq!(session.begin_attempt(FutureId::new(node, 1)), 0);
        assert_eq!(session.begin_attempt(FutureId::new(node, 2)), 1);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.current(), Some(FutureId::new(node, 2)));

        assert!(session.request_cancel());
        assert!(!session.request_cancel());
        assert!(session.mark_finished());
        assert!(!session.mark_finished());
    }

    #[test]
    fn test_wait_pends_until_published() {
        let session = RootSession::new("s", vec![json!(1)], None);
        let mut wait = tokio_test::task::spawn(session.wait());
        tokio_test::assert_pending!(wait.poll());

        session.publish(ExecutionOutcome::Completed);

        assert!(wait.is_woken());
        assert_eq!(tokio_test::assert_ready!(wait.poll()), ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_detached_handle_reports_outcome() {
        let session = Arc::new(RootSession::new("s", vec![json!(1)], None));
        let handle = ExecutionHandle::new(session.clone(), Weak::new());
        assert!(handle.outcome().is_none());

        session.publish(ExecutionOutcome::Failed(ExecutionError::Topology { node: NodeId::new() }));
        handle.cancel();

        assert!(matches!(handle.wait().await, Err(StreamerError::Execution(_))));
    }
}
