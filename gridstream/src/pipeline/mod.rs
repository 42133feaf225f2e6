//! Pipeline building and execution.
//!
//! This module provides:
//! - Pipeline configuration and a validating builder
//! - The orchestrator that admits root executions, dispatches batches to
//!   local workers or remote nodes and tracks their completion
//! - Failover of failed root executions in at-least-once mode
//! - Retry of inter-node sends

mod builder;
mod config;
mod future;
mod history;
mod orchestrator;
mod retry;
mod session;


pub use builder::PipelineBuilder;
pub use config::{PipelineConfig, DEFAULT_CANCELLED_HISTORY_SIZE, DEFAULT_MAX_FAILOVER_ATTEMPTS};
pub use orchestrator::Pipeline;
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryConfig};
pub use session::{ExecutionHandle, FailureListener, ListenerId};
