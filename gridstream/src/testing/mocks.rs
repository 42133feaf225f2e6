//! Test stages and routers.
//!
//! Every stage here is `Clone`; clones share their recorded state, so the same
//! stage can be installed on several nodes and inspected once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StageContext;
use crate::core::{Event, NodeId};
use crate::router::{EventRouter, Routes};
use crate::stages::{Stage, StageOutput};

fn forward(ctx: &StageContext, events: Vec<Event>) -> StageOutput {
    match ctx.next_stage_name() {
        Some(next) => StageOutput::route(next, events),
        None => StageOutput::done(),
    }
}

/// One recorded stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCall {
    /// Node the stage ran on.
    pub node: NodeId,
    /// Events the stage received.
    pub events: Vec<Event>,
}

/// Records every invocation and forwards its events to the next stage.
#[derive(Debug, Clone)]
pub struct RecordingStage {
    name: String,
    calls: Arc<Mutex<Vec<StageCall>>>,
}

impl RecordingStage {
    /// Creates a recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns every recorded invocation.
    #[must_use]
    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns all received events in invocation order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.calls.lock().iter().flat_map(|c| c.events.clone()).collect()
    }

    /// Returns the nodes the stage ran on, in invocation order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeId> {
        self.calls.lock().iter().map(|c| c.node).collect()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput> {
        self.calls.lock().push(StageCall {
            node: ctx.local_node(),
            events: events.clone(),
        });
        Ok(forward(ctx, events))
    }
}

/// Always fails.
#[derive(Debug, Clone)]
pub struct FailingStage {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl FailingStage {
    /// Creates a failing stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _ctx: &StageContext, _events: Vec<Event>) -> anyhow::Result<StageOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::bail!("injected failure #{call} in stage '{}'", self.name)
    }
}

/// Fails its first `failures` invocations, then forwards like
/// [`RecordingStage`].
#[derive(Debug, Clone)]
pub struct FlakyStage {
    name: String,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyStage {
    /// Creates a stage failing `failures` times.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FlakyStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("transient failure #{call} in stage '{}'", self.name);
        }
        Ok(forward(ctx, events))
    }
}

/// Sleeps before forwarding; wakes early when its batch is cancelled.
#[derive(Debug, Clone)]
pub struct SleepingStage {
    name: String,
    delay: Duration,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl SleepingStage {
    /// Creates a stage sleeping `delay` per batch.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of batches that started sleeping.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the number of batches that slept the full delay.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for SleepingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {}
            () = ctx.cancellation_token().cancelled() => anyhow::bail!("cancelled while sleeping"),
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(forward(ctx, events))
    }
}

/// Sends all events of a stage to a fixed node; unmapped stages stay local.
#[derive(Debug, Clone, Default)]
pub struct StageMappedRouter {
    targets: HashMap<String, NodeId>,
}

impl StageMappedRouter {
    /// Creates a router with no mappings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a stage to a node.
    #[must_use]
    pub fn map(mut self, stage: impl Into<String>, node: NodeId) -> Self {
        self.targets.insert(stage.into(), node);
        self
    }
}

impl EventRouter for StageMappedRouter {
    fn route(
        &self,
        stage: &str,
        events: Vec<Event>,
        _projection: &[NodeId],
        local: NodeId,
    ) -> anyhow::Result<Routes> {
        let node = self.targets.get(stage).copied().unwrap_or(local);
        Ok(Routes::from([(node, events)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_stage_forwards() {
        let stage = RecordingStage::new("a");
        let ctx = StageContext::detached("a", Some("b".to_string()));

        let output = stage.process(&ctx, vec![json!(1)]).await.unwrap();

        assert_eq!(output.events_for("b"), Some(&[json!(1)][..]));
        assert_eq!(stage.clone().call_count(), 1);
        assert_eq!(stage.nodes(), vec![ctx.local_node()]);
    }

    #[tokio::test]
    async fn test_flaky_stage_recovers() {
        let stage = FlakyStage::new("a", 1);
        let ctx = StageContext::detached("a", None);

        assert!(stage.process(&ctx, vec![json!(1)]).await.is_err());
        assert!(stage.process(&ctx, vec![json!(1)]).await.unwrap().is_empty());
        assert_eq!(stage.call_count(), 2);
    }

    #[tokio::test]
    async fn test_sleeping_stage_observes_cancellation() {
        let stage = SleepingStage::new("a", Duration::from_secs(30));
        let ctx = StageContext::detached("a", None);
        ctx.cancellation_token().cancel("test");

        assert!(stage.process(&ctx, vec![json!(1)]).await.is_err());
        assert_eq!(stage.started(), 1);
        assert_eq!(stage.finished(), 0);
    }

    #[test]
    fn test_stage_mapped_router() {
        let (local, remote) = (NodeId::new(), NodeId::new());
        let router = StageMappedRouter::new().map("b", remote);

        let routes = router.route("b", vec![json!(1)], &[local, remote], local).unwrap();
        assert_eq!(routes.keys().copied().collect::<Vec<_>>(), vec![remote]);

        let routes = router.route("a", vec![json!(1)], &[local, remote], local).unwrap();
        assert_eq!(routes.keys().copied().collect::<Vec<_>>(), vec![local]);
    }
}
