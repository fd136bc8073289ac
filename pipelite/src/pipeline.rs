//! Linear pipeline of stages connected by work queues.
//!
//! ```text
//! submit ──▶ q0 ──▶ [stage 0] ──▶ q1 ──▶ [stage 1] ──▶ ... ──▶ qN ──▶ collect
//! ```
//!
//! N stages use N+1 queues. Stage `i` pops from queue `i` and pushes to
//! queue `i + 1`. Queue 0 only exists once a stage is registered.
//!
//! ## Drain detection
//!
//! [`Pipeline::collect`] keeps yielding while any queue except the last has
//! items in flight, or the last queue still holds results. An item in flight
//! at queue `k` ends up either at every later queue or as a reported fault,
//! so no sentinel values are needed.
//!
//! ## Ordering
//!
//! With one worker per stage, results come out in submission order. With
//! more workers, only the set of results is guaranteed.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::PipelineOptions;
use crate::errors::{PipeliteError, PipeliteResult};
use crate::metrics::PipelineMetrics;
use crate::queue::{Progress, QueueProbe, WorkQueue};
use crate::stage::{Stage, StageConfig, StageFault, StageRunner, StageSlot, TransformFn};

/// Lifecycle of a pipeline. There is no stopped state: workers live until
/// the pipeline is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No stage registered.
    Empty,
    /// Stages registered, workers not spawned.
    Building,
    /// Workers spawned; accepting submissions and collections.
    Running,
}

/// How one stage is wired into the queue list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub index: usize,
    pub name: String,
    pub workers: usize,
    pub input_queue: u64,
    pub output_queue: u64,
}

/// Queues owned by a pipeline. Closing them on drop lets idle workers exit.
struct QueueSet {
    progress: Arc<Progress>,
    queues: Vec<Arc<dyn QueueProbe>>,
    faults: Arc<WorkQueue<StageFault>>,
}

impl Drop for QueueSet {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.close();
        }
        self.faults.close();
    }
}

/// A chain of stages turning `In` values into `Out` values.
///
/// Registering a stage consumes the pipeline and returns one whose output
/// type is the new stage's output.
pub struct Pipeline<In, Out> {
    options: PipelineOptions,
    queues: QueueSet,
    head: Arc<WorkQueue<In>>,
    tail: Arc<WorkQueue<Out>>,
    stages: Vec<Box<dyn StageRunner>>,
    started_at: Option<Instant>,
    submitted: AtomicU64,
    collected: AtomicU64,
}

impl<T: Send + 'static> Pipeline<T, T> {
    /// Create an empty pipeline with `workers` threads per stage.
    pub fn new(workers: usize) -> Self {
        Self::build(PipelineOptions::with_workers(workers))
    }

    pub fn with_options(options: PipelineOptions) -> PipeliteResult<Self> {
        options.validate()?;
        Ok(Self::build(options))
    }

    /// Register every function in order, each stage with `workers` threads.
    pub fn from_functions<I, F>(functions: I, workers: usize) -> PipeliteResult<Self>
    where
        I: IntoIterator<Item = F>,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let mut pipeline = Self::new(workers);
        for function in functions {
            pipeline = pipeline.register(function)?;
        }
        Ok(pipeline)
    }

    fn build(options: PipelineOptions) -> Self {
        let progress = Progress::new();
        // Until the first registration the head is also the tail; it joins
        // the queue list only once a stage reads from it.
        let head = Arc::new(WorkQueue::with_progress(progress.clone()));
        Self {
            options,
            queues: QueueSet {
                progress,
                queues: Vec::new(),
                faults: Arc::new(WorkQueue::new()),
            },
            tail: head.clone(),
            head,
            stages: Vec::new(),
            started_at: None,
            submitted: AtomicU64::new(0),
            collected: AtomicU64::new(0),
        }
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Append a stage applying `f` to every output of the current tail.
    pub fn register<Next, F>(self, f: F) -> PipeliteResult<Pipeline<In, Next>>
    where
        Next: Send + 'static,
        F: Fn(&Out) -> Next + Send + Sync + 'static,
    {
        self.register_stage(StageConfig::default(), f)
    }

    /// Append a stage whose transform may fail. Failures are reported on
    /// the fault queue instead of producing output.
    pub fn try_register<Next, F, E>(self, f: F) -> PipeliteResult<Pipeline<In, Next>>
    where
        Next: Send + 'static,
        F: Fn(&Out) -> Result<Next, E> + Send + Sync + 'static,
        E: Display,
    {
        self.try_register_stage(StageConfig::default(), f)
    }

    pub fn register_stage<Next, F>(
        self,
        config: StageConfig,
        f: F,
    ) -> PipeliteResult<Pipeline<In, Next>>
    where
        Next: Send + 'static,
        F: Fn(&Out) -> Next + Send + Sync + 'static,
    {
        self.try_register_stage(config, move |value: &Out| Ok::<_, Infallible>(f(value)))
    }

    /// Append a stage with explicit name and worker settings.
    ///
    /// # Errors
    ///
    /// - [`PipeliteError::AlreadyStarted`] if the pipeline is running. The
    ///   pipeline is consumed and torn down in that case.
    /// - [`PipeliteError::InvalidConfig`] for a blank name or zero workers.
    pub fn try_register_stage<Next, F, E>(
        mut self,
        config: StageConfig,
        f: F,
    ) -> PipeliteResult<Pipeline<In, Next>>
    where
        Next: Send + 'static,
        F: Fn(&Out) -> Result<Next, E> + Send + Sync + 'static,
        E: Display,
    {
        if self.started_at.is_some() {
            return Err(PipeliteError::AlreadyStarted);
        }

        let index = self.stages.len();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("stage-{}", index));
        if name.trim().is_empty() {
            return Err(PipeliteError::InvalidConfig(
                "stage name must not be empty".to_string(),
            ));
        }
        let workers = self.options.workers_for(&name, &config);
        if workers == 0 {
            return Err(PipeliteError::InvalidConfig(format!(
                "stage {} must have at least 1 worker",
                name
            )));
        }

        let input = self.tail;
        if self.queues.queues.is_empty() {
            self.queues.queues.push(input.clone());
        }
        let output: Arc<WorkQueue<Next>> =
            Arc::new(WorkQueue::with_progress(self.queues.progress.clone()));
        self.queues.queues.push(output.clone());

        let transform: TransformFn<Out, Next> =
            Arc::new(move |value: &Out| f(value).map_err(|e| e.to_string()));
        let slot = StageSlot {
            index,
            name,
            workers,
            thread_prefix: self.options.thread_prefix.clone(),
        };
        let stage = Stage::new(
            slot,
            input,
            output.clone(),
            self.queues.faults.clone(),
            transform,
        );

        tracing::debug!(
            stage = index,
            name = %stage.name(),
            workers,
            "Registered stage"
        );
        self.stages.push(Box::new(stage));

        Ok(Pipeline {
            options: self.options,
            queues: self.queues,
            head: self.head,
            tail: output,
            stages: self.stages,
            started_at: self.started_at,
            submitted: self.submitted,
            collected: self.collected,
        })
    }

    /// Spawn the workers of every stage, in registration order.
    ///
    /// If a spawn fails the pipeline stays in [`PipelineState::Building`]
    /// with some workers running; calling `start` again spawns the rest.
    pub fn start(&mut self) -> PipeliteResult<()> {
        if self.stages.is_empty() {
            return Err(PipeliteError::NoStages);
        }
        if self.started_at.is_some() {
            return Err(PipeliteError::AlreadyStarted);
        }

        for stage in self.stages.iter_mut().filter(|stage| !stage.is_started()) {
            stage.start()?;
        }
        self.started_at = Some(Instant::now());

        tracing::info!(
            stages = self.stages.len(),
            workers = self.stages.iter().map(|s| s.workers()).sum::<usize>(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Enqueue a value at the head of the pipeline.
    ///
    /// Values submitted before [`start`](Self::start) wait in the head queue.
    pub fn submit(&self, value: In) -> PipeliteResult<()> {
        if self.stages.is_empty() {
            return Err(PipeliteError::NoStages);
        }
        self.head.push(value);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lazily yield results until the pipeline has drained.
    ///
    /// Returns immediately with an empty iterator if nothing is in flight.
    /// Blocks indefinitely if a transform never returns.
    pub fn collect(&mut self) -> PipeliteResult<Collect<'_, In, Out>> {
        if self.stages.is_empty() {
            return Err(PipeliteError::NoStages);
        }
        if self.started_at.is_none() {
            return Err(PipeliteError::NotStarted);
        }
        Ok(Collect { pipeline: self })
    }

    /// Take every fault reported so far.
    pub fn faults(&self) -> Vec<StageFault> {
        std::iter::from_fn(|| {
            let fault = self.queues.faults.try_pop()?;
            self.queues.faults.task_done();
            Some(fault)
        })
        .collect()
    }

    pub fn state(&self) -> PipelineState {
        if self.stages.is_empty() {
            PipelineState::Empty
        } else if self.started_at.is_none() {
            PipelineState::Building
        } else {
            PipelineState::Running
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.queues.len()
    }

    /// Ids of the pipeline's queues, head first.
    pub fn queue_ids(&self) -> Vec<u64> {
        self.queues.queues.iter().map(|queue| queue.id()).collect()
    }

    pub fn stages(&self) -> Vec<StageInfo> {
        self.stages
            .iter()
            .map(|stage| StageInfo {
                index: stage.index(),
                name: stage.name().to_string(),
                workers: stage.workers(),
                input_queue: stage.input_id(),
                output_queue: stage.output_id(),
            })
            .collect()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            uptime_ms: self
                .started_at
                .map(|started| started.elapsed().as_millis())
                .unwrap_or(0),
            submitted: self.submitted.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            stages: self.stages.iter().map(|stage| stage.metrics()).collect(),
        }
    }

    /// Wait for the next result, or `None` once nothing more can arrive.
    fn next_result(&self) -> Option<Out> {
        let (last, upstream) = self.queues.queues.split_last()?;
        let tail = &self.tail;
        debug_assert_eq!(last.id(), tail.id());

        // Upstream counts are read before the tail: an item that leaves the
        // last upstream queue is already in the tail by then.
        let result = self.queues.progress.wait_for(|| {
            let busy = upstream.iter().any(|queue| queue.in_flight() > 0);
            if let Some(item) = tail.try_pop() {
                return Some(Some(item));
            }
            if busy { None } else { Some(None) }
        });

        if result.is_some() {
            tail.task_done();
            self.collected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl<In, Out> std::fmt::Debug for Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("stages", &self.stages.len())
            .field("queues", &self.queues.queues.len())
            .finish()
    }
}

/// Iterator returned by [`Pipeline::collect`].
///
/// Holds the pipeline mutably, so no submission or second collection can
/// interleave with it.
pub struct Collect<'a, In, Out> {
    pipeline: &'a mut Pipeline<In, Out>,
}

impl<In, Out> Iterator for Collect<'_, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Item = Out;

    fn next(&mut self) -> Option<Out> {
        self.pipeline.next_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StageMetrics;
    use std::thread;
    use std::time::Duration;

    /// Runner whose first `failures` start attempts fail.
    struct FlakyStage {
        index: usize,
        failures: usize,
        attempts: usize,
        started: bool,
    }

    impl StageRunner for FlakyStage {
        fn index(&self) -> usize {
            self.index
        }

        fn name(&self) -> &str {
            "flaky"
        }

        fn workers(&self) -> usize {
            1
        }

        fn input_id(&self) -> u64 {
            0
        }

        fn output_id(&self) -> u64 {
            0
        }

        fn start(&mut self) -> PipeliteResult<()> {
            self.attempts += 1;
            if self.attempts <= self.failures {
                return Err(PipeliteError::Spawn {
                    name: "flaky-0".to_string(),
                    source: std::io::Error::other("no threads left"),
                });
            }
            self.started = true;
            Ok(())
        }

        fn is_started(&self) -> bool {
            self.started
        }

        fn metrics(&self) -> StageMetrics {
            StageMetrics {
                index: self.index,
                name: "flaky".to_string(),
                workers: 1,
                processed: 0,
                faulted: 0,
                busy_ms: 0,
                queued: 0,
                in_flight: 0,
            }
        }
    }

    #[test]
    fn test_empty_pipeline_state() {
        let pipeline: Pipeline<String, String> = Pipeline::new(2);
        assert_eq!(pipeline.state(), PipelineState::Empty);
        assert_eq!(pipeline.queue_count(), 0);
        assert_eq!(pipeline.stage_count(), 0);
    }

    #[test]
    fn test_empty_pipeline_rejects_operations() {
        let mut pipeline: Pipeline<i32, i32> = Pipeline::new(1);
        assert!(matches!(pipeline.submit(1), Err(PipeliteError::NoStages)));
        assert!(matches!(pipeline.start(), Err(PipeliteError::NoStages)));
        assert!(matches!(pipeline.collect(), Err(PipeliteError::NoStages)));
    }

    #[test]
    fn test_state_transitions() {
        let pipeline = Pipeline::new(1).register(|x: &i32| x + 1).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Building);

        let mut pipeline = pipeline;
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
    }

    #[test]
    fn test_collect_before_start_fails() {
        let mut pipeline = Pipeline::new(1).register(|x: &i32| x + 1).unwrap();
        assert!(matches!(pipeline.collect(), Err(PipeliteError::NotStarted)));
    }

    #[test]
    fn test_start_twice_fails() {
        let mut pipeline = Pipeline::new(1).register(|x: &i32| x + 1).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(pipeline.start(), Err(PipeliteError::AlreadyStarted)));
    }

    #[test]
    fn test_failed_start_can_be_retried() {
        let mut pipeline = Pipeline::new(2).register(|x: &i32| x + 1).unwrap();
        pipeline.stages.push(Box::new(FlakyStage {
            index: 1,
            failures: 1,
            attempts: 0,
            started: false,
        }));

        let result = pipeline.start();
        assert!(matches!(result, Err(PipeliteError::Spawn { .. })));
        assert_eq!(pipeline.state(), PipelineState::Building);
        assert!(pipeline.stages[0].is_started());
        assert!(!pipeline.stages[1].is_started());
        assert!(matches!(pipeline.collect(), Err(PipeliteError::NotStarted)));

        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(pipeline.stages.iter().all(|stage| stage.is_started()));
        assert!(matches!(pipeline.start(), Err(PipeliteError::AlreadyStarted)));
    }

    #[test]
    fn test_nul_thread_prefix_rejected_before_spawn() {
        let options = PipelineOptions {
            thread_prefix: "bad\0prefix".to_string(),
            ..PipelineOptions::with_workers(1)
        };
        let result = Pipeline::<i32, i32>::with_options(options);
        assert!(matches!(result, Err(PipeliteError::InvalidConfig(_))));
    }

    #[test]
    fn test_register_after_start_fails() {
        let mut pipeline = Pipeline::new(1).register(|x: &i32| x + 1).unwrap();
        pipeline.start().unwrap();
        let result = pipeline.register(|x: &i32| x * 2);
        assert!(matches!(result, Err(PipeliteError::AlreadyStarted)));
    }

    #[test]
    fn test_zero_workers_rejected_at_registration() {
        let result = Pipeline::new(0).register(|x: &i32| x + 1);
        assert!(matches!(result, Err(PipeliteError::InvalidConfig(_))));
    }

    #[test]
    fn test_blank_stage_name_rejected() {
        let result = Pipeline::new(1).register_stage(StageConfig::named("  "), |x: &i32| *x);
        assert!(matches!(result, Err(PipeliteError::InvalidConfig(_))));
    }

    #[test]
    fn test_type_changing_stages() {
        let mut pipeline = Pipeline::new(1)
            .register(|s: &String| s.len())
            .unwrap()
            .register(|n: &usize| n % 2 == 0)
            .unwrap();
        pipeline.start().unwrap();

        for word in ["ab", "abc", "abcd"] {
            pipeline.submit(word.to_string()).unwrap();
        }
        let results: Vec<bool> = pipeline.collect().unwrap().collect();
        assert_eq!(results, vec![true, false, true]);
    }

    #[test]
    fn test_submit_before_start_is_buffered() {
        let mut pipeline = Pipeline::new(2).register(|x: &u32| x * 3).unwrap();
        pipeline.submit(1).unwrap();
        pipeline.submit(2).unwrap();
        pipeline.start().unwrap();

        let mut results: Vec<u32> = pipeline.collect().unwrap().collect();
        results.sort();
        assert_eq!(results, vec![3, 6]);
    }

    #[test]
    fn test_faults_do_not_block_drain() {
        let mut pipeline = Pipeline::new(2)
            .try_register(|x: &i32| {
                if x % 2 == 0 {
                    Err(format!("even: {}", x))
                } else {
                    Ok(*x)
                }
            })
            .unwrap()
            .register(|x: &i32| x * 10)
            .unwrap();
        pipeline.start().unwrap();

        for i in 0..6 {
            pipeline.submit(i).unwrap();
        }
        let mut results: Vec<i32> = pipeline.collect().unwrap().collect();
        results.sort();
        assert_eq!(results, vec![10, 30, 50]);

        let mut faulted: Vec<i32> = pipeline
            .faults()
            .into_iter()
            .map(|fault| fault.into_input::<i32>().unwrap())
            .collect();
        faulted.sort();
        assert_eq!(faulted, vec![0, 2, 4]);
        assert!(pipeline.faults().is_empty());
        assert_eq!(pipeline.queues.faults.in_flight(), 0);
    }

    #[test]
    fn test_only_fault_drains() {
        let mut pipeline = Pipeline::new(1)
            .register(|_: &i32| -> i32 { panic!("boom") })
            .unwrap()
            .register(|x: &i32| *x)
            .unwrap();
        pipeline.start().unwrap();
        pipeline.submit(1).unwrap();

        assert_eq!(pipeline.collect().unwrap().count(), 0);
        let faults = pipeline.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].stage, 0);
        assert_eq!(faults[0].message(), "boom");
    }

    #[test]
    fn test_metrics_counts() {
        let mut pipeline = Pipeline::new(1)
            .register_stage(StageConfig::named("double"), |x: &i32| x * 2)
            .unwrap()
            .try_register_stage(StageConfig::named("check"), |x: &i32| {
                if *x > 4 { Err("too big") } else { Ok(*x) }
            })
            .unwrap();
        pipeline.start().unwrap();

        for i in 1..=3 {
            pipeline.submit(i).unwrap();
        }
        assert_eq!(pipeline.collect().unwrap().count(), 2);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.submitted, 3);
        assert_eq!(metrics.collected, 2);
        assert_eq!(metrics.stage("double").unwrap().processed, 3);
        assert_eq!(metrics.stage("check").unwrap().processed, 2);
        assert_eq!(metrics.stage("check").unwrap().faulted, 1);
        assert_eq!(metrics.total_faulted(), 1);
    }

    #[test]
    fn test_collect_waits_for_slow_stage() {
        let mut pipeline = Pipeline::new(1)
            .register(|x: &u64| {
                thread::sleep(Duration::from_millis(30));
                *x
            })
            .unwrap();
        pipeline.start().unwrap();
        pipeline.submit(9).unwrap();

        let results: Vec<u64> = pipeline.collect().unwrap().collect();
        assert_eq!(results, vec![9]);
    }

    #[test]
    fn test_second_collect_after_drain_is_empty() {
        let mut pipeline = Pipeline::new(2).register(|x: &i32| x + 1).unwrap();
        pipeline.start().unwrap();
        pipeline.submit(1).unwrap();

        assert_eq!(pipeline.collect().unwrap().count(), 1);
        assert_eq!(pipeline.collect().unwrap().count(), 0);

        pipeline.submit(5).unwrap();
        let results: Vec<i32> = pipeline.collect().unwrap().collect();
        assert_eq!(results, vec![6]);
    }
}
