//! Pipeline builder with validation.

use super::config::PipelineConfig;
use super::orchestrator::{Pipeline, PipelineParts};
use super::RetryConfig;
use crate::cluster::{
    ClusterCompute, DeploymentResolver, LocalCompute, Membership, NoopTransport, StandaloneMembership,
    Transport,
};
use crate::errors::{PipelineValidationError, StreamerError};
use crate::events::{EventSink, NoOpEventSink};
use crate::router::{EventRouter, LocalEventRouter};
use crate::stages::Stage;
use crate::window::Window;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Collaborators that are not set default to a single-node setup: local
/// router, standalone membership, a transport that reaches no one, local
/// compute and no lifecycle events.
pub struct PipelineBuilder {
    config: PipelineConfig,
    stages: Vec<Arc<dyn Stage>>,
    windows: Vec<Arc<dyn Window>>,
    router: Option<Arc<dyn EventRouter>>,
    transport: Option<Arc<dyn Transport>>,
    membership: Option<Arc<dyn Membership>>,
    compute: Option<Arc<dyn ClusterCompute>>,
    deployment: Option<Arc<dyn DeploymentResolver>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(PipelineConfig::new(name))
    }

    /// Creates a builder from a full configuration.
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            windows: Vec::new(),
            router: None,
            transport: None,
            membership: None,
            compute: None,
            deployment: None,
            sink: None,
        }
    }

    /// Appends a stage. Stage order defines the pipeline's first stage and
    /// each stage's next stage name.
    #[must_use]
    pub fn stage(self, stage: impl Stage + 'static) -> Self {
        self.stage_arc(Arc::new(stage))
    }

    /// Appends a shared stage.
    #[must_use]
    pub fn stage_arc(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds a window. The first window added is the default window.
    #[must_use]
    pub fn window(self, window: impl Window + 'static) -> Self {
        self.window_arc(Arc::new(window))
    }

    /// Adds a shared window.
    #[must_use]
    pub fn window_arc(mut self, window: Arc<dyn Window>) -> Self {
        self.windows.push(window);
        self
    }

    /// Sets the event router.
    #[must_use]
    pub fn router(mut self, router: Arc<dyn EventRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Sets the messaging transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the membership view.
    #[must_use]
    pub fn membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Sets the compute collaborator used by context queries.
    #[must_use]
    pub fn compute(mut self, compute: Arc<dyn ClusterCompute>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Sets the deployment resolver.
    #[must_use]
    pub fn deployment_resolver(mut self, resolver: Arc<dyn DeploymentResolver>) -> Self {
        self.deployment = Some(resolver);
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Enables or disables at-least-once mode.
    #[must_use]
    pub fn at_least_once(mut self, enabled: bool) -> Self {
        self.config.at_least_once = enabled;
        self
    }

    /// Sets the number of failover restarts.
    #[must_use]
    pub fn max_failover_attempts(mut self, attempts: usize) -> Self {
        self.config.max_failover_attempts = attempts;
        self
    }

    /// Sets the concurrent root execution bound (0 = unbounded).
    #[must_use]
    pub fn max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.config.max_concurrent_sessions = sessions;
        self
    }

    /// Sets the worker pool capacity.
    #[must_use]
    pub fn worker_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.worker_pool_capacity = capacity;
        self
    }

    /// Sets the send retry policy.
    #[must_use]
    pub fn send_retry(mut self, retry: RetryConfig) -> Self {
        self.config.send_retry = retry;
        self
    }

    /// Enables or disables peer deployment.
    #[must_use]
    pub fn peer_deployment(mut self, enabled: bool) -> Self {
        self.config.peer_deployment = enabled;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages or windows, a stage or window
    /// name is blank or duplicated, a scalar setting is invalid, or peer
    /// deployment is enabled without a resolver.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        self.config.validate()?;

        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_names(vec![self.config.name.clone()])
                .with_fix_hint("Add at least one stage to the pipeline before building."));
        }
        if self.windows.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no windows")
                .with_names(vec![self.config.name.clone()])
                .with_fix_hint("Add at least one window; the first one is the default window."));
        }

        check_names("Stage", self.stages.iter().map(|s| s.name()))?;
        check_names("Window", self.windows.iter().map(|w| w.name()))?;

        if self.config.peer_deployment && self.deployment.is_none() {
            return Err(PipelineValidationError::new("Peer deployment requires a deployment resolver")
                .with_names(vec![self.config.name.clone()])
                .with_fix_hint("Set a resolver with deployment_resolver() or disable peer deployment."));
        }
        Ok(())
    }

    /// Builds the pipeline on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StreamerError::Validation`] if validation fails, or
    /// [`StreamerError::Internal`] outside a tokio runtime.
    pub fn build(self) -> Result<Arc<Pipeline>, StreamerError> {
        self.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StreamerError::Internal(format!("no tokio runtime: {e}")))?;

        Pipeline::assemble(PipelineParts {
            config: self.config,
            stages: self.stages,
            windows: self.windows,
            router: self.router.unwrap_or_else(|| Arc::new(LocalEventRouter)),
            transport: self.transport.unwrap_or_else(|| Arc::new(NoopTransport)),
            membership: self
                .membership
                .unwrap_or_else(|| Arc::new(StandaloneMembership::new())),
            compute: self.compute.unwrap_or_else(|| Arc::new(LocalCompute)),
            deployment: self.deployment,
            sink: self.sink.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            runtime,
        })
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("windows", &self.windows.iter().map(|w| w.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn check_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), PipelineValidationError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(PipelineValidationError::new(format!("{kind} name must not be blank"))
                .with_fix_hint(format!("Give every {} a non-empty name.", kind.to_lowercase())));
        }
        if !seen.insert(name) {
            return Err(PipelineValidationError::new(format!("Duplicate {} name '{name}'", kind.to_lowercase()))
                .with_names(vec![name.to_string()])
                .with_fix_hint(format!("{kind} names must be unique within a pipeline.")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticDeploymentResolver;
    use crate::stages::NoOpStage;
    use crate::window::UnboundedWindow;

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new("p")
            .stage(NoOpStage::new("a"))
            .window(UnboundedWindow::new("w"))
    }

    #[test]
    fn test_valid_builder() {
        assert!(builder().validate().is_ok());
        assert_eq!(builder().stage_count(), 1);
    }

    #[test]
    fn test_requires_stages_and_windows() {
        let err = PipelineBuilder::new("p")
            .window(UnboundedWindow::new("w"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("no stages"));

        let err = PipelineBuilder::new("p")
            .stage(NoOpStage::new("a"))
            .validate()
            .unwrap_err();
        assert!(err.message.contains("no windows"));
    }

    #[test]
    fn test_rejects_duplicate_stage_names() {
        let err = builder().stage(NoOpStage::new("a")).validate().unwrap_err();
        assert!(err.message.contains("Duplicate stage"));
        assert_eq!(err.names, vec!["a".to_string()]);
    }

    #[test]
    fn test_rejects_blank_window_name() {
        let err = builder().window(UnboundedWindow::new(" ")).validate().unwrap_err();
        assert!(err.message.contains("Window name"));
    }

    #[test]
    fn test_peer_deployment_needs_resolver() {
        assert!(builder().peer_deployment(true).validate().is_err());
        assert!(builder()
            .peer_deployment(true)
            .deployment_resolver(Arc::new(StaticDeploymentResolver::new("p", "1")))
            .validate()
            .is_ok());
    }

    #[tokio::test]
    async fn test_build_assigns_defaults() {
        let pipeline = builder().stage(NoOpStage::new("b")).build().unwrap();
        assert_eq!(pipeline.name(), "p");
        assert_eq!(pipeline.stage_names(), ["a".to_string(), "b".to_string()]);
        assert_eq!(pipeline.context().next_stage_name(), Some("a"));
        assert_eq!(pipeline.available_permits(), None);
        assert_eq!(pipeline.topic(), "gridstream.pipeline.p");
    }

    #[tokio::test]
    async fn test_build_rejects_oversized_semaphores() {
        let sessions = builder().at_least_once(true).max_concurrent_sessions(usize::MAX).build();
        assert!(matches!(sessions, Err(StreamerError::Validation(_))));

        let workers = builder().worker_pool_capacity(usize::MAX).build();
        assert!(matches!(workers, Err(StreamerError::Validation(_))));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        assert!(matches!(builder().build(), Err(StreamerError::Internal(_))));
    }
}
