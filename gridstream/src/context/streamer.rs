//! Pipeline-level execution context.

use crate::cluster::{ClusterCompute, ComputeTask, LocalCompute, Membership, StandaloneMembership};
use crate::core::NodeId;
use crate::errors::StreamerError;
use crate::observability::{SpanTimer, StreamerMetrics};
use crate::window::{UnboundedWindow, Window, WindowSet};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

struct Inner {
    pipeline: String,
    local_node: NodeId,
    first_stage: Option<String>,
    windows: WindowSet,
    default_window: Arc<dyn Window>,
    local_space: DashMap<String, serde_json::Value>,
    membership: Arc<dyn Membership>,
    compute: Arc<dyn ClusterCompute>,
    metrics: Arc<StreamerMetrics>,
}

/// What a pipeline exposes to stages and to remote query tasks: its windows,
/// a node-local key/value space and cluster-wide query helpers.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct StreamerContext {
    inner: Arc<Inner>,
}

impl StreamerContext {
    pub(crate) fn new(
        pipeline: impl Into<String>,
        first_stage: Option<String>,
        windows: WindowSet,
        membership: Arc<dyn Membership>,
        compute: Arc<dyn ClusterCompute>,
        metrics: Arc<StreamerMetrics>,
    ) -> Result<Self, StreamerError> {
        let default_window = windows
            .default_window()
            .cloned()
            .ok_or_else(|| StreamerError::InvalidArgument("at least one window is required".to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                pipeline: pipeline.into(),
                local_node: membership.local_node(),
                first_stage,
                windows,
                default_window,
                local_space: DashMap::new(),
                membership,
                compute,
                metrics,
            }),
        })
    }

    /// Creates a single-node context with one unbounded window named
    /// `default`, for running stages outside a pipeline.
    #[must_use]
    pub fn detached() -> Self {
        let window: Arc<dyn Window> = Arc::new(UnboundedWindow::new("default"));
        let default_window = window.clone();
        let membership: Arc<dyn Membership> = Arc::new(StandaloneMembership::new());
        Self {
            inner: Arc::new(Inner {
                pipeline: "detached".to_string(),
                local_node: membership.local_node(),
                first_stage: None,
                windows: WindowSet::new(vec![window]),
                default_window,
                local_space: DashMap::new(),
                membership,
                compute: Arc::new(LocalCompute),
                metrics: Arc::new(StreamerMetrics::new(&[])),
            }),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        &self.inner.pipeline
    }

    /// Returns the local node id.
    #[must_use]
    pub fn local_node(&self) -> NodeId {
        self.inner.local_node
    }

    /// Returns the alive nodes running this pipeline.
    #[must_use]
    pub fn projection(&self) -> Vec<NodeId> {
        self.inner.membership.projection(&self.inner.pipeline)
    }

    /// Returns the node-local scratch space shared by all stages.
    #[must_use]
    pub fn local_space(&self) -> &DashMap<String, serde_json::Value> {
        &self.inner.local_space
    }

    /// Returns the default window.
    #[must_use]
    pub fn window(&self) -> &Arc<dyn Window> {
        &self.inner.default_window
    }

    /// Returns a window by name.
    pub fn window_named(&self, name: &str) -> Result<&Arc<dyn Window>, StreamerError> {
        self.inner
            .windows
            .get(name)
            .ok_or_else(|| StreamerError::InvalidArgument(format!("window '{name}' is not configured")))
    }

    pub(crate) fn windows(&self) -> &WindowSet {
        &self.inner.windows
    }

    /// Returns the first stage of the pipeline.
    #[must_use]
    pub fn next_stage_name(&self) -> Option<&str> {
        self.inner.first_stage.as_deref()
    }

    /// Runs `task` on every node of the projection and collects the results.
    pub async fn query<R, F>(&self, task: F) -> Result<Vec<R>, StreamerError>
    where
        R: Serialize + DeserializeOwned,
        F: Fn(&StreamerContext) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let nodes = self.projection();
        self.query_nodes(&nodes, task).await
    }

    /// Runs `task` on the given nodes and collects the results.
    pub async fn query_nodes<R, F>(&self, nodes: &[NodeId], task: F) -> Result<Vec<R>, StreamerError>
    where
        R: Serialize + DeserializeOwned,
        F: Fn(&StreamerContext) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let task: ComputeTask = Arc::new(move |ctx: &StreamerContext| -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::to_value(task(ctx)?)?)
        });

        let timer = SpanTimer::start();
        let values = self.inner.compute.execute(self, nodes, task).await?;
        self.inner.metrics.on_query_completed(timer.elapsed_ms(), nodes.len());

        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StreamerError::from))
            .collect()
    }

    /// Runs `task` on every node of the projection for its side effects.
    pub async fn broadcast<F>(&self, task: F) -> Result<(), StreamerError>
    where
        F: Fn(&StreamerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let nodes = self.projection();
        self.broadcast_nodes(&nodes, task).await
    }

    /// Runs `task` on the given nodes for its side effects.
    pub async fn broadcast_nodes<F>(&self, nodes: &[NodeId], task: F) -> Result<(), StreamerError>
    where
        F: Fn(&StreamerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.query_nodes::<(), _>(nodes, task).await.map(|_| ())
    }

    /// Runs `task` on every node of the projection and folds the results.
    pub async fn reduce<R, T, F, G>(&self, task: F, reducer: G) -> Result<T, StreamerError>
    where
        R: Serialize + DeserializeOwned,
        F: Fn(&StreamerContext) -> anyhow::Result<R> + Send + Sync + 'static,
        G: FnOnce(Vec<R>) -> T,
    {
        let nodes = self.projection();
        self.reduce_nodes(&nodes, task, reducer).await
    }

    /// Runs `task` on the given nodes and folds the results.
    pub async fn reduce_nodes<R, T, F, G>(
        &self,
        nodes: &[NodeId],
        task: F,
        reducer: G,
    ) -> Result<T, StreamerError>
    where
        R: Serialize + DeserializeOwned,
        F: Fn(&StreamerContext) -> anyhow::Result<R> + Send + Sync + 'static,
        G: FnOnce(Vec<R>) -> T,
    {
        self.query_nodes(nodes, task).await.map(reducer)
    }
}

impl std::fmt::Debug for StreamerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamerContext")
            .field("pipeline", &self.inner.pipeline)
            .field("local_node", &self.inner.local_node)
            .field("windows", &self.inner.windows.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_runs_locally() {
        let ctx = StreamerContext::detached();
        ctx.local_space().insert("count".to_string(), json!(3));

        let counts: Vec<i64> = ctx
            .query(|ctx| {
                Ok(ctx
                    .local_space()
                    .get("count")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0))
            })
            .await
            .unwrap();

        assert_eq!(counts, vec![3]);
    }

    #[tokio::test]
    async fn test_reduce_folds_results() {
        let ctx = StreamerContext::detached();
        ctx.window().put(vec![json!(1), json!(2)]);

        let total = ctx
            .reduce(|ctx| Ok(ctx.window().size()), |sizes: Vec<usize>| sizes.into_iter().sum::<usize>())
            .await
            .unwrap();

        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_broadcast_mutates_local_space() {
        let ctx = StreamerContext::detached();
        ctx.broadcast(|ctx| {
            ctx.local_space().insert("seen".to_string(), json!(true));
            Ok(())
        })
        .await
        .unwrap();

        assert!(ctx.local_space().contains_key("seen"));
    }

    #[tokio::test]
    async fn test_query_task_error_is_compute_error() {
        let ctx = StreamerContext::detached();
        let err = ctx
            .query::<i64, _>(|_| anyhow::bail!("boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamerError::Compute(_)));
    }

    #[test]
    fn test_window_named() {
        let ctx = StreamerContext::detached();
        assert!(ctx.window_named("default").is_ok());
        assert!(matches!(
            ctx.window_named("missing"),
            Err(StreamerError::InvalidArgument(_))
        ));
    }
}
