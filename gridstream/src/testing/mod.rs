//! Testing utilities for gridstream pipelines.
//!
//! This module provides:
//! - An in-process multi-node cluster
//! - Recording, failing, flaky and sleeping stages
//! - A router that pins stages to nodes

mod cluster;
mod mocks;

pub use cluster::{ClusterNode, InMemoryCluster};
pub use mocks::{FailingStage, FlakyStage, RecordingStage, SleepingStage, StageCall, StageMappedRouter};
