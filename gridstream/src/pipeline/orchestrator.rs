//! The pipeline orchestrator: admission, dispatch, completion tracking,
//! failover and shutdown for one named pipeline on one node.

use super::config::PipelineConfig;
use super::future::StageExecutionFuture;
use super::history::CancelledHistory;
use super::retry::with_retry;
use super::session::{ExecutionHandle, FailureListener, ListenerId, RootSession};
use crate::cancellation::CancellationToken;
use crate::cluster::{
    pipeline_topic, ClusterCompute, DeploymentResolver, Membership, StreamerMessage, Transport,
};
use crate::context::{StageContext, StreamerContext};
use crate::core::{now_millis, Event, ExecutionBatch, ExecutionOutcome, FutureId, FutureIdGenerator, NodeId};
use crate::errors::{ExecutionError, StreamerError, TransportError};
use crate::events::{event_types, EventSink};
use crate::observability::{MetricsSnapshot, SpanTimer, StreamerMetrics, WindowMetrics};
use crate::router::EventRouter;
use crate::stages::{Stage, StageOutput, StageWrapper};
use crate::window::{Window, WindowSet};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Everything a pipeline is assembled from.
pub(crate) struct PipelineParts {
    pub(crate) config: PipelineConfig,
    pub(crate) stages: Vec<Arc<dyn Stage>>,
    pub(crate) windows: Vec<Arc<dyn Window>>,
    pub(crate) router: Arc<dyn EventRouter>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) membership: Arc<dyn Membership>,
    pub(crate) compute: Arc<dyn ClusterCompute>,
    pub(crate) deployment: Option<Arc<dyn DeploymentResolver>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) runtime: Handle,
}

/// A batch accepted for local execution.
#[derive(Debug)]
struct BatchExecution {
    token: Arc<CancellationToken>,
    children: Mutex<Vec<Arc<StageExecutionFuture>>>,
    started: AtomicBool,
    done: watch::Sender<bool>,
}

impl BatchExecution {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            token: Arc::new(CancellationToken::new()),
            children: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            done,
        }
    }

    fn cancel(&self) {
        self.token.cancel("batch cancelled");
    }

    async fn finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Records stage execution time when the running batch leaves its worker,
/// including when it is dropped by cancellation.
struct RunningStage<'a> {
    metrics: &'a StreamerMetrics,
    stage: &'a str,
    timer: SpanTimer,
    failed: bool,
}

impl<'a> RunningStage<'a> {
    fn new(metrics: &'a StreamerMetrics, stage: &'a str) -> Self {
        Self {
            metrics,
            stage,
            timer: SpanTimer::start(),
            failed: false,
        }
    }

    fn finish(mut self, failed: bool) {
        self.failed = failed;
    }
}

impl Drop for RunningStage<'_> {
    fn drop(&mut self) {
        self.metrics
            .on_stage_finished(self.stage, self.timer.elapsed_ms(), self.failed);
    }
}

/// One named pipeline instance on one node.
///
/// Pipelines are always held in an [`Arc`]; operations that dispatch work take
/// `self: &Arc<Self>`. Several pipelines with the same name on different nodes
/// cooperate through the [`Transport`] and [`Membership`] collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    stages: HashMap<String, StageWrapper>,
    stage_order: Vec<String>,
    router: Arc<dyn EventRouter>,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    deployment: Option<Arc<dyn DeploymentResolver>>,
    sink: Arc<dyn EventSink>,
    ctx: StreamerContext,
    metrics: Arc<StreamerMetrics>,
    topic: String,
    ids: FutureIdGenerator,
    stage_futs: DashMap<FutureId, Arc<StageExecutionFuture>>,
    batches: DashMap<FutureId, Arc<BatchExecution>>,
    cancelled: CancelledHistory,
    listeners: RwLock<Vec<(ListenerId, FailureListener)>>,
    next_listener: AtomicU64,
    admission: Option<Arc<Semaphore>>,
    workers: Semaphore,
    window_lock: tokio::sync::RwLock<()>,
    started: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
    runtime: Handle,
}

impl Pipeline {
    pub(crate) fn assemble(parts: PipelineParts) -> Result<Arc<Self>, StreamerError> {
        let PipelineParts {
            config,
            stages,
            windows,
            router,
            transport,
            membership,
            compute,
            deployment,
            sink,
            runtime,
        } = parts;

        let stage_order: Vec<String> = stages.iter().map(|s| s.name().to_string()).collect();
        let metrics = Arc::new(StreamerMetrics::new(&stage_order));
        let ctx = StreamerContext::new(
            config.name.clone(),
            stage_order.first().cloned(),
            WindowSet::new(windows),
            membership.clone(),
            compute,
            metrics.clone(),
        )?;
        let stages = StageWrapper::chain(&stages)
            .into_iter()
            .map(|w| (w.name().to_string(), w))
            .collect();
        let admission = config
            .bounded_sessions()
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_sessions)));

        Ok(Arc::new(Self {
            topic: pipeline_topic(&config.name),
            ids: FutureIdGenerator::new(membership.local_node()),
            cancelled: CancelledHistory::new(config.cancelled_history_size),
            workers: Semaphore::new(config.worker_pool_capacity),
            admission,
            config,
            stages,
            stage_order,
            router,
            transport,
            membership,
            deployment,
            sink,
            ctx,
            metrics,
            stage_futs: DashMap::new(),
            batches: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            window_lock: tokio::sync::RwLock::new(()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            runtime,
        }))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the local node id.
    #[must_use]
    pub fn local_node(&self) -> NodeId {
        self.ctx.local_node()
    }

    /// Returns the stage names in configuration order.
    #[must_use]
    pub fn stage_names(&self) -> &[String] {
        &self.stage_order
    }

    /// Returns the pipeline context shared by all stages on this node.
    #[must_use]
    pub fn context(&self) -> &StreamerContext {
        &self.ctx
    }

    /// Returns the topic remote pipeline messages are sent on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns true once [`Pipeline::stop`] was called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Number of stage futures this node is tracking.
    #[must_use]
    pub fn tracked_futures(&self) -> usize {
        self.stage_futs.len()
    }

    /// Number of batches accepted for local execution that have not finished.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        self.batches.len()
    }

    /// Free admission permits, or `None` if root submissions are unbounded.
    #[must_use]
    pub fn available_permits(&self) -> Option<usize> {
        self.admission.as_ref().map(|s| s.available_permits())
    }

    /// Runs the `on_start` hooks of stages, windows and router. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::Internal`] if a hook fails.
    pub fn start(&self) -> Result<(), StreamerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for name in &self.stage_order {
            if let Some(wrapper) = self.stages.get(name) {
                wrapper.stage().on_start().map_err(|e| {
                    StreamerError::Internal(format!("stage '{name}' failed to start: {e:#}"))
                })?;
            }
        }
        for window in self.ctx.windows().iter() {
            window.on_start().map_err(|e| {
                StreamerError::Internal(format!("window '{}' failed to start: {e:#}", window.name()))
            })?;
        }
        self.router
            .on_start()
            .map_err(|e| StreamerError::Internal(format!("router failed to start: {e:#}")))?;

        info!(
            pipeline = %self.config.name,
            node_id = %self.local_node(),
            stages = self.stage_order.len(),
            at_least_once = self.config.at_least_once,
            "Pipeline started"
        );
        Ok(())
    }

    /// Submits events to the first stage.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::submit`].
    pub async fn add_events(self: &Arc<Self>, events: Vec<Event>) -> Result<ExecutionHandle, StreamerError> {
        let first = self
            .stage_order
            .first()
            .cloned()
            .ok_or_else(|| StreamerError::Internal("pipeline has no stages".to_string()))?;
        self.submit(&first, events).await
    }

    /// Submits one event to the first stage.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::submit`].
    pub async fn add_event(self: &Arc<Self>, event: Event) -> Result<ExecutionHandle, StreamerError> {
        self.add_events(vec![event]).await
    }

    /// Submits one event to the named stage.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::submit`].
    pub async fn add_event_to_stage(
        self: &Arc<Self>,
        stage: &str,
        event: Event,
    ) -> Result<ExecutionHandle, StreamerError> {
        self.submit(stage, vec![event]).await
    }

    /// Submits events to the named stage.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::submit`].
    pub async fn add_events_to_stage(
        self: &Arc<Self>,
        stage: &str,
        events: Vec<Event>,
    ) -> Result<ExecutionHandle, StreamerError> {
        self.submit(stage, events).await
    }

    /// Starts a root execution of `stage` over `events`.
    ///
    /// In at-least-once mode with a session bound, waits for an admission
    /// permit first. The returned handle resolves when the execution tree
    /// completed, failed after exhausting failover, or was cancelled.
    ///
    /// # Errors
    ///
    /// - [`StreamerError::InvalidArgument`] for an empty event list or a
    ///   blank or unknown stage name
    /// - [`StreamerError::Stopping`] once the pipeline is stopping
    pub async fn submit(self: &Arc<Self>, stage: &str, events: Vec<Event>) -> Result<ExecutionHandle, StreamerError> {
        if stage.trim().is_empty() {
            return Err(StreamerError::InvalidArgument("stage name must not be blank".to_string()));
        }
        if events.is_empty() {
            return Err(StreamerError::InvalidArgument("events must not be empty".to_string()));
        }
        if !self.stages.contains_key(stage) {
            return Err(StreamerError::InvalidArgument(format!(
                "stage '{stage}' is not configured in pipeline '{}'",
                self.config.name
            )));
        }
        if self.is_stopping() {
            return Err(StreamerError::Stopping(self.config.name.clone()));
        }

        let permit = match &self.admission {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| StreamerError::Stopping(self.config.name.clone()))?,
            ),
            None => None,
        };
        if self.is_stopping() {
            return Err(StreamerError::Stopping(self.config.name.clone()));
        }

        let session = Arc::new(RootSession::new(stage, events, permit));
        if self.config.at_least_once {
            self.metrics.on_session_started();
        }
        self.sink.try_emit(
            event_types::SESSION_STARTED,
            Some(json!({
                "pipeline": self.config.name,
                "stage": stage,
                "events": session.events().len(),
            })),
        );

        self.start_root(&session);
        Ok(ExecutionHandle::new(session, Arc::downgrade(self)))
    }

    fn start_root(self: &Arc<Self>, session: &Arc<RootSession>) {
        let id = self.ids.next_id();
        let attempt = session.begin_attempt(id);
        let fut = Arc::new(StageExecutionFuture::root(id, session.clone(), now_millis(), attempt));

        debug!(
            pipeline = %self.config.name,
            future_id = %id,
            stage = %session.stage(),
            attempt,
            "Starting root execution"
        );

        self.map_future(&fut, session.events().to_vec(), BTreeSet::new());
        if session.is_cancelled() {
            self.cancel_future(&fut);
        }
    }

    /// Routes `events` for the future's stage and dispatches one batch per
    /// target node.
    fn map_future(
        self: &Arc<Self>,
        fut: &Arc<StageExecutionFuture>,
        events: Vec<Event>,
        mut execution_nodes: BTreeSet<NodeId>,
    ) {
        let local = self.local_node();
        let mut projection = self.membership.projection(&self.config.name);
        if projection.is_empty() {
            projection.push(local);
        }

        let routes = match self.router.route(fut.stage(), events, &projection, local) {
            Ok(mut routes) => {
                routes.retain(|_, events| !events.is_empty());
                if routes.is_empty() {
                    Err(ExecutionError::Routing {
                        stage: fut.stage().to_string(),
                        message: "router assigned no events".to_string(),
                    })
                } else {
                    Ok(routes)
                }
            }
            Err(e) => Err(ExecutionError::Routing {
                stage: fut.stage().to_string(),
                message: format!("{e:#}"),
            }),
        };
        let routes = match routes {
            Ok(routes) => routes,
            Err(err) => {
                warn!(future_id = %fut.id(), error = %err, "Failed to map future");
                if let Some(outcome) = fut.fail(err) {
                    self.on_future_completed(fut, outcome);
                }
                return;
            }
        };

        execution_nodes.extend(routes.keys().copied());
        let nodes: Vec<NodeId> = routes.keys().copied().collect();
        fut.mapped(nodes.iter().copied());
        if fut.status().is_terminal() {
            return;
        }
        self.stage_futs.insert(fut.id(), fut.clone());

        for (node, events) in routes {
            let batch = ExecutionBatch {
                execution_id: fut.execution_id(),
                future_id: fut.id(),
                parent_future_id: fut.parent_id(),
                execution_start_ts: fut.start_ts(),
                stage_name: fut.stage().to_string(),
                execution_node_ids: execution_nodes.clone(),
                events,
            };
            if node == local {
                self.schedule_local(batch);
            } else {
                let this = self.clone();
                let fut = fut.clone();
                self.runtime.spawn(async move { this.send_batch(node, fut, batch).await });
            }
        }

        // Departed nodes may never produce a discovery event for this future.
        for node in nodes {
            if node != local && !self.membership.is_alive(node) {
                if let Some(outcome) = fut.on_node_left(node) {
                    self.on_future_completed(fut, outcome);
                }
            }
        }
    }

    fn schedule_local(self: &Arc<Self>, batch: ExecutionBatch) {
        let local = self.local_node();
        let fid = batch.future_id;

        if self.stopped.load(Ordering::SeqCst) {
            debug!(future_id = %fid, "Refusing batch on stopped node");
            self.complete_parent_stage(fid, Some(ExecutionError::Stopped { node: local }));
            return;
        }

        let Some(wrapper) = self.stages.get(&batch.stage_name).cloned() else {
            error!(
                pipeline = %self.config.name,
                stage = %batch.stage_name,
                future_id = %fid,
                "Batch names a stage that is not configured on this node"
            );
            self.complete_parent_stage(fid, Some(ExecutionError::unknown_stage(&batch.stage_name, local)));
            return;
        };

        let exec = Arc::new(BatchExecution::new());
        self.batches.insert(fid, exec.clone());
        if self.cancelled.contains(&fid) {
            self.batches.remove_if(&fid, |_, e| Arc::ptr_eq(e, &exec));
            debug!(future_id = %fid, "Dropping batch cancelled before it arrived");
            return;
        }

        self.metrics.on_stage_scheduled();
        self.runtime.spawn(self.clone().run_batch(wrapper, batch, exec));
    }

    fn run_batch(
        self: Arc<Self>,
        wrapper: StageWrapper,
        batch: ExecutionBatch,
        exec: Arc<BatchExecution>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let fid = batch.future_id;
            let queued = SpanTimer::start();
            let result = tokio::select! {
                biased;
                () = exec.token.cancelled() => None,
                error = self.execute_batch(&wrapper, &batch, &exec, queued) => Some(error),
            };

            self.batches.remove_if(&fid, |_, e| Arc::ptr_eq(e, &exec));
            exec.done.send_replace(true);

            match result {
                Some(error) => self.complete_parent_stage(fid, error),
                None => {
                    debug!(future_id = %fid, stage = %wrapper.name(), "Batch cancelled");
                    let children = std::mem::take(&mut *exec.children.lock());
                    for child in children {
                        self.cancel_future(&child);
                    }
                    if !exec.started.load(Ordering::SeqCst) {
                        self.metrics.on_stage_dropped();
                    }
                }
            }
        }
        .boxed()
    }

    /// Runs the stage and waits for the children it spawned. Returns the
    /// error to report upstream.
    async fn execute_batch(
        self: &Arc<Self>,
        wrapper: &StageWrapper,
        batch: &ExecutionBatch,
        exec: &Arc<BatchExecution>,
        queued: SpanTimer,
    ) -> Option<ExecutionError> {
        let local = self.local_node();
        let Ok(slot) = self.workers.acquire().await else {
            return Some(ExecutionError::Stopped { node: local });
        };
        exec.started.store(true, Ordering::SeqCst);

        let stage = wrapper.name();
        self.metrics.on_stage_started(stage, queued.elapsed_ms());
        let running = RunningStage::new(&self.metrics, stage);
        let ctx = StageContext::new(
            self.ctx.clone(),
            stage,
            wrapper.next_stage_name().map(str::to_string),
            exec.token.clone(),
        );

        let result = {
            let _window = self.window_lock.read().await;
            AssertUnwindSafe(async { wrapper.stage().process(&ctx, batch.events.clone()).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("stage panicked: {}", panic_message(payload.as_ref())))
                })
        };
        running.finish(result.is_err());
        drop(slot);

        match result {
            Err(err) => {
                let error = ExecutionError::stage_failed(stage, &err);
                warn!(
                    pipeline = %self.config.name,
                    stage = %stage,
                    future_id = %batch.future_id,
                    error = %error,
                    "Stage execution failed"
                );
                if self.config.at_least_once {
                    return Some(error);
                }
                self.notify_listeners(stage, &batch.events, &error);
                self.sink.try_emit(
                    event_types::BATCH_FAILED,
                    Some(json!({
                        "pipeline": self.config.name,
                        "stage": stage,
                        "future_id": batch.future_id.to_string(),
                        "error": error.to_dict(),
                    })),
                );
                None
            }
            Ok(output) if output.is_empty() => {
                let latency = u64::try_from(now_millis() - batch.execution_start_ts).unwrap_or(0);
                self.metrics
                    .on_pipeline_completed(latency, batch.execution_node_ids.len());
                None
            }
            Ok(output) => self.run_children(batch, exec, output).await,
        }
    }

    async fn run_children(
        self: &Arc<Self>,
        batch: &ExecutionBatch,
        exec: &Arc<BatchExecution>,
        output: StageOutput,
    ) -> Option<ExecutionError> {
        let local = self.local_node();
        let routes = output.into_routes();
        if let Some((stage, _)) = routes.iter().find(|(stage, _)| !self.stages.contains_key(stage)) {
            return Some(ExecutionError::unknown_stage(stage, local));
        }

        let mut children = Vec::with_capacity(routes.len());
        for (stage, events) in routes {
            let child = Arc::new(StageExecutionFuture::child(
                self.ids.next_id(),
                batch.execution_id,
                batch.future_id,
                stage,
                batch.execution_start_ts,
            ));
            exec.children.lock().push(child.clone());
            self.map_future(&child, events, batch.execution_node_ids.clone());
            children.push(child);
        }

        let mut pending: FuturesUnordered<_> = children.iter().map(|c| c.wait()).collect();
        while let Some(outcome) = pending.next().await {
            let error = match outcome {
                ExecutionOutcome::Completed => continue,
                ExecutionOutcome::Failed(error) => error,
                ExecutionOutcome::Cancelled => ExecutionError::Stopped { node: local },
            };
            for child in &children {
                self.cancel_future(child);
            }
            return Some(error);
        }
        None
    }

    /// Reports a finished local batch to the owner of its future.
    fn complete_parent_stage(self: &Arc<Self>, future_id: FutureId, error: Option<ExecutionError>) {
        let local = self.local_node();
        let owner = future_id.node();
        if owner == local {
            self.on_execution_completed(local, future_id, error);
            return;
        }

        let this = self.clone();
        self.runtime.spawn(async move {
            let message = StreamerMessage::Response { future_id, error };
            if let Err(e) = this.send_message(owner, &message).await {
                if e.is_topology() || !this.membership.is_alive(owner) {
                    debug!(future_id = %future_id, node_id = %owner, "Owner left; response dropped");
                } else {
                    warn!(future_id = %future_id, node_id = %owner, error = %e, "Failed to send response");
                }
            }
        });
    }

    fn on_execution_completed(self: &Arc<Self>, node: NodeId, future_id: FutureId, error: Option<ExecutionError>) {
        let fut = self.stage_futs.get(&future_id).map(|e| e.value().clone());
        let Some(fut) = fut else {
            debug!(future_id = %future_id, node_id = %node, "Completion for unknown future ignored");
            return;
        };
        if let Some(outcome) = fut.on_execution_completed(node, error) {
            self.on_future_completed(&fut, outcome);
        }
    }

    fn on_future_completed(self: &Arc<Self>, fut: &Arc<StageExecutionFuture>, outcome: ExecutionOutcome) {
        self.stage_futs.remove(&fut.id());
        debug!(future_id = %fut.id(), stage = %fut.stage(), status = %outcome.status(), "Future finished");

        if !outcome.is_completed() {
            for node in fut.pending_nodes() {
                self.cancel_child_stage(node, fut.id());
            }
        }
        if let Some(session) = fut.session() {
            self.on_root_completed(session, fut, outcome);
        }
    }

    fn on_root_completed(
        self: &Arc<Self>,
        session: &Arc<RootSession>,
        fut: &StageExecutionFuture,
        outcome: ExecutionOutcome,
    ) {
        let error = match outcome {
            ExecutionOutcome::Failed(error) => error,
            other => {
                self.finish_session(session, other);
                return;
            }
        };

        let attempt = fut.attempt();
        let retry = self.config.at_least_once
            && !self.is_stopping()
            && !session.is_cancelled()
            && error.is_recoverable()
            && attempt < self.config.max_failover_attempts;
        if !retry {
            self.finish_session(session, ExecutionOutcome::Failed(error));
            return;
        }

        self.metrics.on_failover();
        warn!(
            pipeline = %self.config.name,
            future_id = %fut.id(),
            attempt = attempt + 1,
            max_attempts = self.config.max_failover_attempts,
            error = %error,
            "Restarting failed execution"
        );
        self.sink.try_emit(
            event_types::FAILOVER,
            Some(json!({
                "pipeline": self.config.name,
                "stage": session.stage(),
                "attempt": attempt + 1,
                "error": error.to_dict(),
            })),
        );
        self.start_root(session);
    }

    fn finish_session(&self, session: &RootSession, outcome: ExecutionOutcome) {
        if !session.mark_finished() {
            return;
        }
        session.release_permit();
        if self.config.at_least_once {
            self.metrics.on_session_finished();
        }

        match &outcome {
            ExecutionOutcome::Completed => {
                debug!(pipeline = %self.config.name, stage = %session.stage(), "Execution completed");
                self.sink.try_emit(
                    event_types::SESSION_COMPLETED,
                    Some(json!({
                        "pipeline": self.config.name,
                        "stage": session.stage(),
                        "attempts": session.attempts(),
                    })),
                );
            }
            ExecutionOutcome::Failed(error) => {
                error!(
                    pipeline = %self.config.name,
                    stage = %session.stage(),
                    attempts = session.attempts(),
                    error = %error,
                    "Execution failed"
                );
                self.notify_listeners(session.stage(), session.events(), error);
                self.sink.try_emit(
                    event_types::SESSION_FAILED,
                    Some(json!({
                        "pipeline": self.config.name,
                        "stage": session.stage(),
                        "attempts": session.attempts(),
                        "error": error.to_dict(),
                    })),
                );
            }
            ExecutionOutcome::Cancelled => {
                debug!(pipeline = %self.config.name, stage = %session.stage(), "Execution cancelled");
                self.sink.try_emit(
                    event_types::SESSION_CANCELLED,
                    Some(json!({
                        "pipeline": self.config.name,
                        "stage": session.stage(),
                    })),
                );
            }
        }
        session.publish(outcome);
    }

    pub(crate) fn cancel_session(self: &Arc<Self>, session: &Arc<RootSession>) {
        if !session.request_cancel() {
            return;
        }
        let fut = session
            .current()
            .and_then(|id| self.stage_futs.get(&id).map(|e| e.value().clone()));
        if let Some(fut) = fut {
            self.cancel_future(&fut);
        }
    }

    fn cancel_future(self: &Arc<Self>, fut: &Arc<StageExecutionFuture>) {
        if let Some(outcome) = fut.cancel() {
            self.on_future_completed(fut, outcome);
        }
    }

    /// Cancels the batch of `future_id` running on `node`.
    fn cancel_child_stage(self: &Arc<Self>, node: NodeId, future_id: FutureId) {
        if node == self.local_node() {
            self.cancelled.insert(future_id);
            if let Some((_, exec)) = self.batches.remove(&future_id) {
                debug!(future_id = %future_id, "Cancelling local batch");
                exec.cancel();
            }
            return;
        }

        let this = self.clone();
        self.runtime.spawn(async move {
            let message = StreamerMessage::CancelRequest { future_id };
            if let Err(e) = this.send_message(node, &message).await {
                debug!(future_id = %future_id, node_id = %node, error = %e, "Cancel request not delivered");
            }
        });
    }

    async fn send_batch(self: Arc<Self>, node: NodeId, fut: Arc<StageExecutionFuture>, batch: ExecutionBatch) {
        let deployment = match (&self.deployment, self.config.peer_deployment) {
            (Some(resolver), true) => match resolver.descriptor(&self.config.name) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    let error = ExecutionError::Configuration {
                        message: format!("failed to build deployment descriptor: {e:#}"),
                    };
                    if let Some(outcome) = fut.on_execution_completed(node, Some(error)) {
                        self.on_future_completed(&fut, outcome);
                    }
                    return;
                }
            },
            _ => None,
        };

        let message = StreamerMessage::ExecutionRequest { batch, deployment };
        let Err(e) = self.send_message(node, &message).await else {
            return;
        };

        let outcome = if e.is_topology() || !self.membership.is_alive(node) {
            debug!(future_id = %fut.id(), node_id = %node, "Batch target left the cluster");
            fut.on_node_left(node)
        } else {
            warn!(future_id = %fut.id(), node_id = %node, error = %e, "Failed to send batch");
            fut.on_execution_completed(
                node,
                Some(ExecutionError::Transport {
                    node,
                    message: e.to_string(),
                }),
            )
        };
        if let Some(outcome) = outcome {
            self.on_future_completed(&fut, outcome);
        }
    }

    async fn send_message(&self, node: NodeId, message: &StreamerMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        let transport = &self.transport;
        let membership = &self.membership;
        let topic = self.topic.as_str();
        let label = format!("{} to {node}", message.kind());

        with_retry(
            &self.config.send_retry,
            &label,
            move || transport.send(node, topic, payload.clone()),
            |e: &TransportError| !e.is_topology() && membership.is_alive(node),
        )
        .await
    }

    /// Handles a message received on [`Pipeline::topic`] from `sender`.
    ///
    /// Undecodable messages and requests whose deployment cannot be resolved
    /// are logged and dropped.
    pub fn on_message(self: &Arc<Self>, sender: NodeId, payload: &[u8]) {
        let message = match StreamerMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(pipeline = %self.config.name, node_id = %sender, error = %e, "Dropping undecodable message");
                return;
            }
        };

        match message {
            StreamerMessage::ExecutionRequest { batch, deployment } => {
                if let (Some(descriptor), Some(resolver)) = (&deployment, &self.deployment) {
                    if let Err(e) = resolver.resolve(sender, descriptor) {
                        let reason = format!("{e:#}");
                        warn!(
                            pipeline = %self.config.name,
                            node_id = %sender,
                            future_id = %batch.future_id,
                            error = %reason,
                            "Dropping execution request with unresolvable deployment"
                        );
                        return;
                    }
                }
                self.schedule_local(batch);
            }
            StreamerMessage::CancelRequest { future_id } => {
                self.cancel_child_stage(self.local_node(), future_id);
            }
            StreamerMessage::Response { future_id, error } => {
                self.on_execution_completed(sender, future_id, error);
            }
        }
    }

    /// Fails every tracked future still waiting on `node`.
    pub fn on_node_left(self: &Arc<Self>, node: NodeId) {
        let futures: Vec<_> = self.stage_futs.iter().map(|e| e.value().clone()).collect();
        let mut failed = 0usize;
        for fut in futures {
            if let Some(outcome) = fut.on_node_left(node) {
                failed += 1;
                self.on_future_completed(&fut, outcome);
            }
        }

        info!(pipeline = %self.config.name, node_id = %node, failed_futures = failed, "Node left");
        self.sink.try_emit(
            event_types::NODE_LEFT,
            Some(json!({
                "pipeline": self.config.name,
                "node_id": node.to_string(),
                "failed_futures": failed,
            })),
        );
    }

    /// Stops the pipeline.
    ///
    /// New root submissions and failover restarts are refused from now on.
    /// With `cancel` every tracked future and local batch is cancelled;
    /// otherwise waits for every root future and then for the remaining local
    /// batches. Afterwards the node refuses batches and runs the `on_stop`
    /// hooks.
    pub async fn stop(self: &Arc<Self>, cancel: bool) {
        if self.stopping.swap(true, Ordering::SeqCst) && self.stopped.load(Ordering::SeqCst) {
            return;
        }
        info!(pipeline = %self.config.name, cancel, "Stopping pipeline");

        if cancel {
            let futures: Vec<_> = self.stage_futs.iter().map(|e| e.value().clone()).collect();
            for fut in futures {
                self.cancel_future(&fut);
            }
            let ids: Vec<FutureId> = self.batches.iter().map(|e| *e.key()).collect();
            for id in ids {
                self.cancel_child_stage(self.local_node(), id);
            }
        } else {
            loop {
                let roots: Vec<_> = self
                    .stage_futs
                    .iter()
                    .filter(|e| e.value().is_root())
                    .map(|e| e.value().clone())
                    .collect();
                if roots.is_empty() {
                    break;
                }
                for root in roots {
                    root.wait().await;
                }
                tokio::task::yield_now().await;
            }
            loop {
                let batches: Vec<_> = self.batches.iter().map(|e| e.value().clone()).collect();
                if batches.is_empty() {
                    break;
                }
                for exec in batches {
                    exec.finished().await;
                }
            }
        }

        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.workers.close();
        if let Some(admission) = &self.admission {
            admission.close();
        }

        for name in &self.stage_order {
            if let Some(wrapper) = self.stages.get(name) {
                wrapper.stage().on_stop();
            }
        }
        for window in self.ctx.windows().iter() {
            window.on_stop();
        }
        self.router.on_stop();
        info!(pipeline = %self.config.name, "Pipeline stopped");
    }

    /// Resets every window and clears the local space once running stages
    /// released the window lock.
    pub async fn reset(&self) {
        let _guard = self.window_lock.write().await;
        for window in self.ctx.windows().iter() {
            window.reset();
        }
        self.ctx.local_space().clear();
        debug!(pipeline = %self.config.name, "Pipeline reset");
    }

    /// Returns a metrics snapshot including window sizes.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.windows = self
            .ctx
            .windows()
            .iter()
            .map(|w| WindowMetrics {
                name: w.name().to_string(),
                size: w.size(),
                eviction_queue_size: w.eviction_queue_size(),
            })
            .collect();
        snapshot
    }

    /// Zeroes the metric counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Registers a listener for executions that failed for good.
    pub fn add_failure_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &[Event], &ExecutionError) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_failure_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify_listeners(&self, stage: &str, events: &[Event], error: &ExecutionError) {
        let listeners: Vec<FailureListener> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| listener(stage, events, error))) {
                warn!(
                    pipeline = %self.config.name,
                    stage = %stage,
                    "Failure listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.config.name)
            .field("local_node", &self.local_node())
            .field("stages", &self.stage_order)
            .field("tracked_futures", &self.stage_futs.len())
            .field("active_batches", &self.batches.len())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}
