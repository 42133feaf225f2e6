//! Stage trait and implementations.
//!
//! A stage consumes a batch of events and returns the events that should flow
//! to downstream stages. An empty [`StageOutput`] ends that branch of the
//! pipeline.

mod output;
mod wrapper;

pub use output::StageOutput;
pub use wrapper::StageWrapper;

use crate::context::StageContext;
use crate::core::Event;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
///
/// Stages must tolerate re-execution: in at-least-once mode a failed
/// execution tree is restarted from its first stage.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage. Must be unique within a pipeline.
    fn name(&self) -> &str;

    /// Processes one batch of events.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The stage execution context
    /// * `events` - The batch, in submission order
    ///
    /// # Returns
    ///
    /// The events to route to downstream stages, or an error that fails the
    /// batch.
    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput>;

    /// Called once when the owning pipeline starts.
    fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the owning pipeline stops.
    fn on_stop(&self) {}
}

type StageFn =
    dyn Fn(&StageContext, Vec<Event>) -> anyhow::Result<StageOutput> + Send + Sync + 'static;

/// A synchronous function-based stage.
pub struct FnStage {
    name: String,
    func: Box<StageFn>,
}

impl FnStage {
    /// Creates a new function-based stage.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StageContext, Vec<Event>) -> anyhow::Result<StageOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput> {
        (self.func)(ctx, events)
    }
}

/// A stage that ends the pipeline without doing anything.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, _ctx: &StageContext, _events: Vec<Event>) -> anyhow::Result<StageOutput> {
        Ok(StageOutput::done())
    }
}

/// A stage that forwards its input unchanged to the next configured stage.
#[derive(Debug, Clone)]
pub struct ForwardStage {
    name: String,
}

impl ForwardStage {
    /// Creates a new forwarding stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for ForwardStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, events: Vec<Event>) -> anyhow::Result<StageOutput> {
        Ok(match ctx.next_stage_name() {
            Some(next) => StageOutput::route(next, events),
            None => StageOutput::done(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("double", |_ctx, events| {
            let doubled = events
                .iter()
                .filter_map(serde_json::Value::as_i64)
                .map(|v| json!(v * 2))
                .collect();
            Ok(StageOutput::route("sink", doubled))
        });

        assert_eq!(stage.name(), "double");

        let ctx = StageContext::detached("double", None);
        let output = stage.process(&ctx, vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(output.events_for("sink"), Some(&[json!(2), json!(4)][..]));
    }

    #[tokio::test]
    async fn test_noop_stage_ends_branch() {
        let stage = NoOpStage::new("noop");
        let ctx = StageContext::detached("noop", None);
        let output = stage.process(&ctx, vec![json!(1)]).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_forward_stage_uses_next_stage() {
        let stage = ForwardStage::new("a");

        let ctx = StageContext::detached("a", Some("b".to_string()));
        let output = stage.process(&ctx, vec![json!(1)]).await.unwrap();
        assert_eq!(output.events_for("b"), Some(&[json!(1)][..]));

        let last = StageContext::detached("a", None);
        assert!(stage.process(&last, vec![json!(1)]).await.unwrap().is_empty());
    }
}
