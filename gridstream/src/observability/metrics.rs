//! Streamer metrics.
//!
//! Counters are lock-free atomics updated from worker tasks and completion
//! paths. [`StreamerMetrics::snapshot`] produces a serializable view.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running min/max/average of a series of samples.
#[derive(Debug)]
struct Stat {
    count: AtomicU64,
    total: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }
}

impl Stat {
    fn record(&self, sample: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(sample, Ordering::Relaxed);
        self.min.fetch_min(sample, Ordering::Relaxed);
        self.max.fetch_max(sample, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return StatSnapshot::default();
        }
        StatSnapshot {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            avg: self.total.load(Ordering::Relaxed) / count,
            count,
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

/// Min/max/average over recorded samples. All zero when nothing was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    /// Smallest sample.
    pub min: u64,
    /// Largest sample.
    pub max: u64,
    /// Integer average.
    pub avg: u64,
    /// Number of samples.
    pub count: u64,
}

#[derive(Debug, Default)]
struct StageCounters {
    executions: AtomicU64,
    failures: AtomicU64,
    executing: AtomicU64,
    exec_time: Stat,
    wait_time: Stat,
}

/// Per-stage metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Stage name.
    pub name: String,
    /// Completed executions, successful or not.
    pub total_executions: u64,
    /// Failed executions.
    pub failures: u64,
    /// Executions currently running.
    pub executing: u64,
    /// Execution time in milliseconds.
    pub execution_time_ms: StatSnapshot,
    /// Time between scheduling and start, in milliseconds.
    pub waiting_time_ms: StatSnapshot,
}

/// Per-window metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMetrics {
    /// Window name.
    pub name: String,
    /// Retained events.
    pub size: usize,
    /// Evicted events not yet polled.
    pub eviction_queue_size: usize,
}

/// A point-in-time view of all streamer metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Stage metrics in configuration order.
    pub stages: Vec<StageMetrics>,
    /// Window metrics in configuration order.
    pub windows: Vec<WindowMetrics>,
    /// Root start to branch end, in milliseconds.
    pub pipeline_latency_ms: StatSnapshot,
    /// Number of nodes an execution tree touched.
    pub execution_nodes: StatSnapshot,
    /// Query duration in milliseconds.
    pub query_time_ms: StatSnapshot,
    /// Number of nodes a query ran on.
    pub query_nodes: StatSnapshot,
    /// Root sessions in flight.
    pub current_active_sessions: u64,
    /// Highest number of root sessions in flight.
    pub max_active_sessions: u64,
    /// Root sessions ever admitted.
    pub total_sessions: u64,
    /// Failover restarts.
    pub failovers: u64,
    /// Batches waiting for a worker.
    pub stages_waiting: u64,
    /// Batches running on a worker.
    pub stages_active: u64,
}

/// Atomic metric counters of one pipeline instance.
#[derive(Debug)]
pub struct StreamerMetrics {
    stage_order: Vec<String>,
    stages: HashMap<String, StageCounters>,
    pipeline_latency: Stat,
    execution_nodes: Stat,
    query_time: Stat,
    query_nodes: Stat,
    active_sessions: AtomicU64,
    max_active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    failovers: AtomicU64,
    stages_waiting: AtomicU64,
    stages_active: AtomicU64,
}

impl StreamerMetrics {
    /// Creates zeroed counters for the given stages.
    #[must_use]
    pub fn new(stage_names: &[String]) -> Self {
        Self {
            stage_order: stage_names.to_vec(),
            stages: stage_names
                .iter()
                .map(|name| (name.clone(), StageCounters::default()))
                .collect(),
            pipeline_latency: Stat::default(),
            execution_nodes: Stat::default(),
            query_time: Stat::default(),
            query_nodes: Stat::default(),
            active_sessions: AtomicU64::new(0),
            max_active_sessions: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            stages_waiting: AtomicU64::new(0),
            stages_active: AtomicU64::new(0),
        }
    }

    /// Records an admitted root session.
    pub fn on_session_started(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        let active = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_active_sessions.fetch_max(active, Ordering::Relaxed);
    }

    /// Records a root session reaching its final outcome.
    pub fn on_session_finished(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Records a failover restart.
    pub fn on_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a batch queued for a worker.
    pub fn on_stage_scheduled(&self) {
        self.stages_waiting.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a batch leaving the queue without running.
    pub fn on_stage_dropped(&self) {
        let _ = self
            .stages_waiting
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Records a batch starting on a worker after `wait_ms` in the queue.
    pub fn on_stage_started(&self, stage: &str, wait_ms: u64) {
        self.on_stage_dropped();
        self.stages_active.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.stages.get(stage) {
            counters.executing.fetch_add(1, Ordering::Relaxed);
            counters.wait_time.record(wait_ms);
        }
    }

    /// Records a batch leaving its worker.
    pub fn on_stage_finished(&self, stage: &str, exec_ms: u64, failed: bool) {
        let _ = self
            .stages_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        if let Some(counters) = self.stages.get(stage) {
            let _ = counters
                .executing
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
            counters.executions.fetch_add(1, Ordering::Relaxed);
            counters.exec_time.record(exec_ms);
            if failed {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records a pipeline branch reaching its end.
    pub fn on_pipeline_completed(&self, latency_ms: u64, nodes: usize) {
        self.pipeline_latency.record(latency_ms);
        self.execution_nodes.record(nodes as u64);
    }

    /// Records a finished query.
    pub fn on_query_completed(&self, time_ms: u64, nodes: usize) {
        self.query_time.record(time_ms);
        self.query_nodes.record(nodes as u64);
    }

    /// Returns the number of root sessions in flight.
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Returns the number of failover restarts.
    #[must_use]
    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// Builds a snapshot. Window metrics are filled in by the caller.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self
            .stage_order
            .iter()
            .filter_map(|name| {
                self.stages.get(name).map(|c| StageMetrics {
                    name: name.clone(),
                    total_executions: c.executions.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    executing: c.executing.load(Ordering::Relaxed),
                    execution_time_ms: c.exec_time.snapshot(),
                    waiting_time_ms: c.wait_time.snapshot(),
                })
            })
            .collect();

        MetricsSnapshot {
            stages,
            windows: Vec::new(),
            pipeline_latency_ms: self.pipeline_latency.snapshot(),
            execution_nodes: self.execution_nodes.snapshot(),
            query_time_ms: self.query_time.snapshot(),
            query_nodes: self.query_nodes.snapshot(),
            current_active_sessions: self.active_sessions.load(Ordering::Relaxed),
            max_active_sessions: self.max_active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            stages_waiting: self.stages_waiting.load(Ordering::Relaxed),
            stages_active: self.stages_active.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    ///
    /// Gauges of work in flight (active sessions, waiting and running batches)
    /// are kept so that later decrements stay balanced.
    pub fn reset(&self) {
        for counters in self.stages.values() {
            counters.executions.store(0, Ordering::Relaxed);
            counters.failures.store(0, Ordering::Relaxed);
            counters.exec_time.reset();
            counters.wait_time.reset();
        }
        self.pipeline_latency.reset();
        self.execution_nodes.reset();
        self.query_time.reset();
        self.query_nodes.reset();
        self.max_active_sessions
            .store(self.active_sessions.load(Ordering::Relaxed), Ordering::Relaxed);
        self.total_sessions.store(0, Ordering::Relaxed);
        self.failovers.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metrics() -> StreamerMetrics {
        StreamerMetrics::new(&["a".to_string(), "b".to_string()])
    }

    #[test]
    fn test_stat_min_max_avg() {
        let m = metrics();
        m.on_pipeline_completed(10, 1);
        m.on_pipeline_completed(30, 3);

        let snap = m.snapshot();
        assert_eq!(
            snap.pipeline_latency_ms,
            StatSnapshot {
                min: 10,
                max: 30,
                avg: 20,
                count: 2
            }
        );
        assert_eq!(snap.execution_nodes.max, 3);
    }

    #[test]
    fn test_empty_stat_is_zero() {
        assert_eq!(metrics().snapshot().query_time_ms, StatSnapshot::default());
    }

    #[test]
    fn test_session_gauges() {
        let m = metrics();
        m.on_session_started();
        m.on_session_started();
        m.on_session_finished();

        let snap = m.snapshot();
        assert_eq!(snap.current_active_sessions, 1);
        assert_eq!(snap.max_active_sessions, 2);
        assert_eq!(snap.total_sessions, 2);
    }

    #[test]
    fn test_session_finished_never_underflows() {
        let m = metrics();
        m.on_session_finished();
        assert_eq!(m.active_sessions(), 0);
    }

    #[test]
    fn test_stage_lifecycle() {
        let m = metrics();
        m.on_stage_scheduled();
        assert_eq!(m.snapshot().stages_waiting, 1);

        m.on_stage_started("b", 5);
        let running = m.snapshot();
        assert_eq!(running.stages_waiting, 0);
        assert_eq!(running.stages_active, 1);
        assert_eq!(running.stages[1].executing, 1);

        m.on_stage_finished("b", 7, true);
        let done = m.snapshot();
        assert_eq!(done.stages[1].total_executions, 1);
        assert_eq!(done.stages[1].failures, 1);
        assert_eq!(done.stages[1].execution_time_ms.max, 7);
        assert_eq!(done.stages[1].waiting_time_ms.max, 5);
        assert_eq!(done.stages_active, 0);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let m = metrics();
        m.on_session_started();
        m.on_failover();
        m.on_query_completed(4, 2);
        m.on_stage_started("a", 1);
        m.on_stage_finished("a", 1, false);

        m.reset();

        let snap = m.snapshot();
        assert_eq!(snap.failovers, 0);
        assert_eq!(snap.total_sessions, 0);
        assert_eq!(snap.query_nodes, StatSnapshot::default());
        assert_eq!(snap.stages[0].total_executions, 0);
        assert_eq!(snap.current_active_sessions, 1);
    }
}
