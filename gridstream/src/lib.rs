//! # Gridstream
//!
//! Distributed stream processing pipelines for a compute grid.
//!
//! A pipeline is a chain of named stages running on every node of a cluster.
//! Events submitted to a stage are routed to nodes, processed in batches, and
//! whatever a stage emits flows on to the next stages. Gridstream provides:
//!
//! - **Execution tracking**: every batch belongs to a future whose completion
//!   waits for all downstream work, across nodes
//! - **At-least-once mode**: failed execution trees are restarted from the
//!   root with the original events, with bounded concurrent sessions
//! - **Node-local windows**: evictable event buffers shared by the stages of
//!   one node, plus query/broadcast/reduce over the cluster
//! - **Pluggable cluster collaborators**: transport, membership, compute and
//!   deployment are traits the embedding application implements
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gridstream::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("words")
//!     .stage(SplitStage::new("split"))
//!     .stage(CountStage::new("count"))
//!     .window(UnboundedWindow::new("recent"))
//!     .at_least_once(true)
//!     .build()?;
//!
//! let processor = StreamProcessor::new();
//! processor.add(pipeline.clone())?;
//!
//! pipeline.add_event(json!("to be or not to be")).await?.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cluster;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod processor;
pub mod router;
pub mod stages;
pub mod testing;
pub mod window;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::cluster::{
        ClusterCompute, DeploymentResolver, LocalCompute, Membership, NoopTransport,
        StandaloneMembership, Transport,
    };
    pub use crate::context::{StageContext, StreamerContext};
    pub use crate::core::{Event, ExecutionOutcome, FutureId, NodeId};
    pub use crate::errors::{ExecutionError, PipelineValidationError, StreamerError, TransportError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{ExecutionHandle, Pipeline, PipelineBuilder, PipelineConfig, RetryConfig};
    pub use crate::processor::{PipelineAttributes, StreamProcessor};
    pub use crate::router::{EventRouter, KeyHashEventRouter, LocalEventRouter, RoundRobinEventRouter};
    pub use crate::stages::{FnStage, ForwardStage, NoOpStage, Stage, StageOutput};
    pub use crate::window::{SizeBoundedWindow, UnboundedWindow, Window};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_prelude_builds_a_pipeline() {
        let pipeline = PipelineBuilder::new("words")
            .stage(ForwardStage::new("split"))
            .stage(NoOpStage::new("count"))
            .window(SizeBoundedWindow::new("recent", 8))
            .build()
            .unwrap();
        let processor = StreamProcessor::new();
        processor.add(pipeline.clone()).unwrap();

        pipeline.add_event(json!("x")).await.unwrap().wait().await.unwrap();
        assert_eq!(processor.attributes()[0].stages, vec!["split", "count"]);
    }
}
