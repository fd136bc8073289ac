//! Stage definition and worker loop.
//!
//! A stage owns handles to its input and output queues (the queues
//! themselves belong to the pipeline) and runs a fixed pool of worker
//! threads. Each worker loops: pop an item, apply the transform, push the
//! result, mark the item done.
//!
//! With more than one worker, results may reach the output queue in a
//! different order than their inputs were submitted.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::errors::{PipeliteError, PipeliteResult};
use crate::metrics::{StageCounters, StageMetrics};
use crate::queue::WorkQueue;

/// Type-erased transform shared by all workers of a stage.
pub type TransformFn<In, Out> = Arc<dyn Fn(&In) -> Result<Out, String> + Send + Sync>;

/// Per-stage registration settings.
///
/// Unset fields fall back to the pipeline's options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConfig {
    pub name: Option<String>,
    pub workers: Option<usize>,
}

impl StageConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            workers: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Why a transform failed on one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The transform returned an error.
    Error(String),
    /// The transform panicked.
    Panic(String),
}

/// A transform failure, reported with the input that caused it.
pub struct StageFault {
    pub stage: usize,
    pub stage_name: String,
    pub worker: usize,
    pub kind: FaultKind,
    input: Box<dyn Any + Send>,
}

impl StageFault {
    pub fn message(&self) -> &str {
        match &self.kind {
            FaultKind::Error(message) | FaultKind::Panic(message) => message,
        }
    }

    /// Borrow the offending input if it has type `T`.
    pub fn input<T: 'static>(&self) -> Option<&T> {
        self.input.downcast_ref::<T>()
    }

    /// Take ownership of the offending input if it has type `T`.
    pub fn into_input<T: 'static>(self) -> Result<T, Self> {
        match self.input.downcast::<T>() {
            Ok(input) => Ok(*input),
            Err(input) => Err(Self { input, ..self }),
        }
    }
}

impl std::fmt::Debug for StageFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFault")
            .field("stage", &self.stage)
            .field("stage_name", &self.stage_name)
            .field("worker", &self.worker)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for StageFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FaultKind::Error(message) => write!(
                f,
                "stage {} ({}) worker {} failed: {}",
                self.stage, self.stage_name, self.worker, message
            ),
            FaultKind::Panic(message) => write!(
                f,
                "stage {} ({}) worker {} panicked: {}",
                self.stage, self.stage_name, self.worker, message
            ),
        }
    }
}

/// Object-safe handle the pipeline keeps for each of its stages.
pub trait StageRunner: Send + Sync {
    fn index(&self) -> usize;

    fn name(&self) -> &str;

    fn workers(&self) -> usize;

    /// Id of the queue this stage pops from.
    fn input_id(&self) -> u64;

    /// Id of the queue this stage pushes to.
    fn output_id(&self) -> u64;

    /// Spawn the stage's worker threads.
    ///
    /// After a failed spawn, calling again spawns only the missing workers.
    fn start(&mut self) -> PipeliteResult<()>;

    /// Whether every worker has been spawned.
    fn is_started(&self) -> bool;

    fn metrics(&self) -> StageMetrics;
}

/// One transformation step backed by a fixed worker pool.
pub struct Stage<In, Out> {
    index: usize,
    name: String,
    workers: usize,
    thread_prefix: String,
    input: Arc<WorkQueue<In>>,
    output: Arc<WorkQueue<Out>>,
    faults: Arc<WorkQueue<StageFault>>,
    transform: TransformFn<In, Out>,
    counters: Arc<StageCounters>,
    handles: Vec<JoinHandle<()>>,
}

/// Where a stage sits in the pipeline and how it is run.
pub(crate) struct StageSlot {
    pub index: usize,
    pub name: String,
    pub workers: usize,
    pub thread_prefix: String,
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(
        slot: StageSlot,
        input: Arc<WorkQueue<In>>,
        output: Arc<WorkQueue<Out>>,
        faults: Arc<WorkQueue<StageFault>>,
        transform: TransformFn<In, Out>,
    ) -> Self {
        Self {
            index: slot.index,
            name: slot.name,
            workers: slot.workers,
            thread_prefix: slot.thread_prefix,
            input,
            output,
            faults,
            transform,
            counters: Arc::new(StageCounters::default()),
            handles: Vec::new(),
        }
    }

    fn worker(&self, worker: usize) -> Worker<In, Out> {
        Worker {
            stage: self.index,
            stage_name: self.name.clone(),
            worker,
            input: self.input.clone(),
            output: self.output.clone(),
            faults: self.faults.clone(),
            transform: self.transform.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<In, Out> StageRunner for Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn input_id(&self) -> u64 {
        self.input.id()
    }

    fn output_id(&self) -> u64 {
        self.output.id()
    }

    fn start(&mut self) -> PipeliteResult<()> {
        if self.is_started() {
            return Err(PipeliteError::AlreadyStarted);
        }

        for n in self.handles.len()..self.workers {
            let worker = self.worker(n);
            let name = format!("{}-{}-{}", self.thread_prefix, self.index, n);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .map_err(|source| PipeliteError::Spawn { name, source })?;
            self.handles.push(handle);
        }

        tracing::debug!(
            stage = self.index,
            name = %self.name,
            workers = self.workers,
            "Stage started"
        );
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.handles.len() == self.workers
    }

    fn metrics(&self) -> StageMetrics {
        StageMetrics {
            index: self.index,
            name: self.name.clone(),
            workers: self.workers,
            processed: self.counters.processed(),
            faulted: self.counters.faulted(),
            busy_ms: self.counters.busy().as_millis(),
            queued: self.input.len(),
            in_flight: self.input.in_flight(),
        }
    }
}

/// State moved into one worker thread.
struct Worker<In, Out> {
    stage: usize,
    stage_name: String,
    worker: usize,
    input: Arc<WorkQueue<In>>,
    output: Arc<WorkQueue<Out>>,
    faults: Arc<WorkQueue<StageFault>>,
    transform: TransformFn<In, Out>,
    counters: Arc<StageCounters>,
}

impl<In, Out> Worker<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn run(self) {
        while let Some(item) = self.input.pop() {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.transform)(&item)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(Ok(result)) => {
                    self.output.push(result);
                    self.counters.record_success(elapsed);
                }
                Ok(Err(message)) => {
                    self.counters.record_fault(elapsed);
                    self.report(FaultKind::Error(message), item);
                }
                Err(payload) => {
                    self.counters.record_fault(elapsed);
                    self.report(FaultKind::Panic(panic_message(payload.as_ref())), item);
                }
            }

            // Done only after the result or fault is visible downstream.
            self.input.task_done();
        }

        tracing::debug!(stage = self.stage, worker = self.worker, "Worker exiting");
    }

    fn report(&self, kind: FaultKind, input: In) {
        let fault = StageFault {
            stage: self.stage,
            stage_name: self.stage_name.clone(),
            worker: self.worker,
            kind,
            input: Box::new(input),
        };
        tracing::warn!(
            stage = self.stage,
            worker = self.worker,
            "{}",
            fault
        );
        self.faults.push(fault);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
