//! Core domain model types for gridstream.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Node and future identifiers
//! - Execution batches
//! - Future status and execution outcome enums

mod batch;
mod ids;
mod status;

pub use batch::ExecutionBatch;
pub use ids::{FutureId, FutureIdGenerator, NodeId};
pub use status::{ChildStatus, ExecutionOutcome, FutureStatus};

/// A streamed event. Events are opaque JSON values to the pipeline.
pub type Event = serde_json::Value;

/// Returns the current wall clock time in milliseconds since the epoch.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
