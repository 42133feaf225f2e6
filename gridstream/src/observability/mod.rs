//! Observability utilities.

mod metrics;
mod tracing;

pub use metrics::{
    MetricsSnapshot, StageMetrics, StatSnapshot, StreamerMetrics, WindowMetrics,
};
pub use tracing::{init_tracing, SpanTimer};
