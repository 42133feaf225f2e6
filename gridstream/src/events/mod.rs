//! Lifecycle events emitted by a pipeline.
//!
//! Every pipeline is configured with its own [`EventSink`]. The event type
//! names are listed in [`event_types`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, RecordedEvent};

/// Event type names emitted by the pipeline.
pub mod event_types {
    /// A root submission was admitted.
    pub const SESSION_STARTED: &str = "streamer.session.started";
    /// A root execution tree completed.
    pub const SESSION_COMPLETED: &str = "streamer.session.completed";
    /// A root execution failed terminally.
    pub const SESSION_FAILED: &str = "streamer.session.failed";
    /// A root execution was cancelled.
    pub const SESSION_CANCELLED: &str = "streamer.session.cancelled";
    /// A failed root was restarted.
    pub const FAILOVER: &str = "streamer.failover";
    /// A batch failed in non-strict mode.
    pub const BATCH_FAILED: &str = "streamer.batch.failed";
    /// A node left and tracked futures were swept.
    pub const NODE_LEFT: &str = "streamer.node.left";
}
