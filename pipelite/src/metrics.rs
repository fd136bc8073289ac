//! Stage and pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free per-stage counters, shared by all workers of one stage.
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    faulted: AtomicU64,
    busy_nanos: AtomicU64,
}

impl StageCounters {
    pub fn record_success(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.add_busy(elapsed);
    }

    pub fn record_fault(&self, elapsed: Duration) {
        self.faulted.fetch_add(1, Ordering::Relaxed);
        self.add_busy(elapsed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn faulted(&self) -> u64 {
        self.faulted.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> Duration {
        Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed))
    }

    fn add_busy(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub workers: usize,
    /// Items transformed successfully.
    pub processed: u64,
    /// Items whose transform returned an error or panicked.
    pub faulted: u64,
    /// Wall time spent inside the transform, summed over workers.
    pub busy_ms: u128,
    /// Items waiting in the stage's input queue.
    pub queued: usize,
    /// Items pushed to the stage's input queue and not yet finished.
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Time since the pipeline was started, zero if it never was.
    pub uptime_ms: u128,
    pub submitted: u64,
    pub collected: u64,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn total_faulted(&self) -> u64 {
        self.stages.iter().map(|stage| stage.faulted).sum()
    }
}
