//! Event sink trait and implementations.

use crate::core::now_millis;
use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Receives pipeline lifecycle events.
///
/// Each pipeline owns its sink; there is no process-wide sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "streamer.session.started")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking.
    ///
    /// Must never panic; failures are logged and suppressed. The pipeline calls
    /// this from completion paths that must not await.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// An event sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Streamer event");
        } else {
            info!(event_type = %event_type, event_data = ?data, "Streamer event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// One event captured by a [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Event type name.
    pub event_type: String,
    /// Event payload.
    pub data: Option<serde_json::Value>,
    /// Capture time in epoch milliseconds.
    pub at_ms: i64,
}

/// Keeps every emitted event in memory. Meant for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    recorded: parking_lot::Mutex<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured events in emission order.
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.recorded.lock().clone()
    }

    /// Returns the captured events whose type starts with `prefix`.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<RecordedEvent> {
        self.recorded
            .lock()
            .iter()
            .filter(|e| e.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Returns how many events of exactly this type were captured.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.recorded.lock().iter().filter(|e| e.event_type == event_type).count()
    }

    /// Returns the payload of the latest event of this type.
    #[must_use]
    pub fn last_data(&self, event_type: &str) -> Option<serde_json::Value> {
        self.recorded
            .lock()
            .iter()
            .rev()
            .find(|e| e.event_type == event_type)
            .and_then(|e| e.data.clone())
    }

    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recorded.lock().len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recorded.lock().is_empty()
    }

    /// Drops everything captured so far.
    pub fn clear(&self) {
        self.recorded.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.recorded.lock().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
            at_ms: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit("test", None).await;
        sink.try_emit("test", Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::debug();
        sink.emit("streamer.failover", Some(serde_json::json!({"attempt": 1}))).await;
        sink.try_emit("streamer.failover", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter_and_count() {
        let sink = CollectingEventSink::new();
        sink.emit("streamer.session.started", None).await;
        sink.emit("streamer.session.completed", None).await;
        sink.try_emit("streamer.failover", None);
        sink.try_emit("streamer.failover", None);

        sink.try_emit("streamer.failover", Some(serde_json::json!({"attempt": 2})));

        assert_eq!(sink.len(), 5);
        assert_eq!(sink.with_prefix("streamer.session.").len(), 2);
        assert_eq!(sink.count("streamer.failover"), 3);
        assert_eq!(sink.last_data("streamer.failover"), Some(serde_json::json!({"attempt": 2})));
        assert_eq!(sink.recorded()[0].event_type, "streamer.session.started");

        sink.clear();
        assert!(sink.is_empty());
    }
}
