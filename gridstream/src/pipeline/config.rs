//! Scalar pipeline settings.

use super::RetryConfig;
use crate::errors::PipelineValidationError;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Default size of the recently-cancelled future id history.
pub const DEFAULT_CANCELLED_HISTORY_SIZE: usize = 4096;

/// Default number of failover restarts per root submission.
pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: usize = 3;

fn default_worker_pool_capacity() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Settings of one pipeline instance. Immutable once the pipeline is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline name. Pipelines with the same name on different nodes form
    /// one distributed pipeline.
    pub name: String,
    /// Track every root execution to completion and restart failed ones.
    pub at_least_once: bool,
    /// Restarts allowed after the first attempt of a root execution.
    pub max_failover_attempts: usize,
    /// Bound on concurrently running root executions; 0 means unbounded.
    /// Only enforced in at-least-once mode.
    pub max_concurrent_sessions: usize,
    /// Number of batches that may run stage code at the same time.
    pub worker_pool_capacity: usize,
    /// Retry policy for inter-node sends.
    pub send_retry: RetryConfig,
    /// How many cancelled future ids to remember.
    pub cancelled_history_size: usize,
    /// Attach deployment descriptors to execution requests.
    pub peer_deployment: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            at_least_once: false,
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            max_concurrent_sessions: 0,
            worker_pool_capacity: default_worker_pool_capacity(),
            send_retry: RetryConfig::default(),
            cancelled_history_size: DEFAULT_CANCELLED_HISTORY_SIZE,
            peer_deployment: false,
        }
    }
}

impl PipelineConfig {
    /// Creates a default configuration with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Enables or disables at-least-once mode.
    #[must_use]
    pub fn with_at_least_once(mut self, enabled: bool) -> Self {
        self.at_least_once = enabled;
        self
    }

    /// Sets the number of failover restarts.
    #[must_use]
    pub fn with_max_failover_attempts(mut self, attempts: usize) -> Self {
        self.max_failover_attempts = attempts;
        self
    }

    /// Sets the concurrent root execution bound.
    #[must_use]
    pub fn with_max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.max_concurrent_sessions = sessions;
        self
    }

    /// Sets the worker pool capacity.
    #[must_use]
    pub fn with_worker_pool_capacity(mut self, capacity: usize) -> Self {
        self.worker_pool_capacity = capacity;
        self
    }

    /// Sets the send retry policy.
    #[must_use]
    pub fn with_send_retry(mut self, retry: RetryConfig) -> Self {
        self.send_retry = retry;
        self
    }

    /// Sets the cancelled id history size.
    #[must_use]
    pub fn with_cancelled_history_size(mut self, size: usize) -> Self {
        self.cancelled_history_size = size;
        self
    }

    /// Enables or disables peer deployment.
    #[must_use]
    pub fn with_peer_deployment(mut self, enabled: bool) -> Self {
        self.peer_deployment = enabled;
        self
    }

    /// Returns true if root submissions take admission permits.
    #[must_use]
    pub fn bounded_sessions(&self) -> bool {
        self.at_least_once && self.max_concurrent_sessions > 0
    }

    /// Checks the scalar settings.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Pipeline name must not be blank")
                .with_fix_hint("Give the pipeline a non-empty name."));
        }
        if self.worker_pool_capacity == 0 {
            return Err(PipelineValidationError::new("Worker pool capacity must be positive")
                .with_names(vec![self.name.clone()]));
        }
        if self.worker_pool_capacity > Semaphore::MAX_PERMITS {
            return Err(PipelineValidationError::new(format!(
                "Worker pool capacity {} exceeds the maximum of {}",
                self.worker_pool_capacity,
                Semaphore::MAX_PERMITS
            ))
            .with_names(vec![self.name.clone()]));
        }
        if self.max_concurrent_sessions > Semaphore::MAX_PERMITS {
            return Err(PipelineValidationError::new(format!(
                "Max concurrent sessions {} exceeds the maximum of {}",
                self.max_concurrent_sessions,
                Semaphore::MAX_PERMITS
            ))
            .with_names(vec![self.name.clone()])
            .with_fix_hint("Use 0 for unbounded sessions."));
        }
        if self.cancelled_history_size == 0 {
            return Err(PipelineValidationError::new("Cancelled history size must be positive")
                .with_names(vec![self.name.clone()]));
        }
        if self.send_retry.max_attempts == 0 {
            return Err(PipelineValidationError::new("Send retry needs at least one attempt")
                .with_names(vec![self.name.clone()]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(!config.at_least_once);
        assert_eq!(config.max_failover_attempts, 3);
        assert_eq!(config.max_concurrent_sessions, 0);
        assert_eq!(config.cancelled_history_size, 4096);
        assert_eq!(config.send_retry.max_attempts, 3);
        assert!(config.worker_pool_capacity > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bounded_sessions_needs_strict_mode() {
        let config = PipelineConfig::new("p").with_max_concurrent_sessions(2);
        assert!(!config.bounded_sessions());
        assert!(config.with_at_least_once(true).bounded_sessions());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::new("  ").validate().is_err());
        assert!(PipelineConfig::new("p").with_worker_pool_capacity(0).validate().is_err());
        assert!(PipelineConfig::new("p").with_cancelled_history_size(0).validate().is_err());
        assert!(PipelineConfig::new("p")
            .with_worker_pool_capacity(Semaphore::MAX_PERMITS + 1)
            .validate()
            .is_err());
        assert!(PipelineConfig::new("p")
            .with_at_least_once(true)
            .with_max_concurrent_sessions(usize::MAX)
            .validate()
            .is_err());
        assert!(PipelineConfig::new("p")
            .with_max_concurrent_sessions(Semaphore::MAX_PERMITS)
            .validate()
            .is_ok());
        assert!(PipelineConfig::new("p")
            .with_send_retry(RetryConfig::new().with_max_attempts(0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"name": "orders", "at_least_once": true}"#).unwrap();
        assert_eq!(config.name, "orders");
        assert!(config.at_least_once);
        assert_eq!(config.max_failover_attempts, 3);
    }
}
