//! Per-batch stage execution context.

use super::StreamerContext;
use crate::cancellation::CancellationToken;
use std::ops::Deref;
use std::sync::Arc;

/// The context a stage sees while processing one batch.
///
/// Dereferences to the pipeline's [`StreamerContext`].
#[derive(Debug, Clone)]
pub struct StageContext {
    streamer: StreamerContext,
    stage_name: String,
    next_stage_name: Option<String>,
    token: Arc<CancellationToken>,
}

impl StageContext {
    pub(crate) fn new(
        streamer: StreamerContext,
        stage_name: impl Into<String>,
        next_stage_name: Option<String>,
        token: Arc<CancellationToken>,
    ) -> Self {
        Self {
            streamer,
            stage_name: stage_name.into(),
            next_stage_name,
            token,
        }
    }

    /// Creates a context over [`StreamerContext::detached`], for unit-testing
    /// stages.
    #[must_use]
    pub fn detached(stage_name: impl Into<String>, next_stage_name: Option<String>) -> Self {
        Self::new(
            StreamerContext::detached(),
            stage_name,
            next_stage_name,
            Arc::new(CancellationToken::new()),
        )
    }

    /// Returns the running stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the stage configured after the running one.
    #[must_use]
    pub fn next_stage_name(&self) -> Option<&str> {
        self.next_stage_name.as_deref()
    }

    /// Returns true once the batch has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the batch's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Returns the pipeline context.
    #[must_use]
    pub fn streamer(&self) -> &StreamerContext {
        &self.streamer
    }
}

impl Deref for StageContext {
    type Target = StreamerContext;

    fn deref(&self) -> &Self::Target {
        &self.streamer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_context_shadows_next_stage() {
        let ctx = StageContext::detached("a", Some("b".to_string()));
        assert_eq!(ctx.stage_name(), "a");
        assert_eq!(ctx.next_stage_name(), Some("b"));
        assert_eq!(ctx.streamer().next_stage_name(), None);
    }

    #[test]
    fn test_stage_context_derefs_to_streamer() {
        let ctx = StageContext::detached("a", None);
        ctx.window().put(vec![json!(1)]);
        assert_eq!(ctx.streamer().window().size(), 1);
    }

    #[test]
    fn test_cancellation_is_visible() {
        let ctx = StageContext::detached("a", None);
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel("stop");
        assert!(ctx.is_cancelled());
    }
}
