//! Fluent pipeline construction and execution.
//!
//! A [`PipelineBuilder`] records named steps; [`PipelineBuilder::build`]
//! validates them and produces a reusable [`Pipeline`]. Each execution gets a
//! fresh id and, when enabled, one metrics collector per step.

use super::metrics::{PipelineMetrics, RunMonitor, StepDescriptor};
use super::retry::execute_with_retry;
use super::stage::{ExecutionMode, Stage, StepOptions};
use super::state::{Envelope, PipelineState, Resources, StepContext};
use crate::compose::{self, Transform};
use crate::metrics::{MetricsCollector, wrap_with_metrics};
use crate::options::PipelineOptions;
use crate::parallel::{ParallelOptions, run_window};
use crate::sequence::Sequence;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::{self, Future};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// EXECUTION SCOPE
// ============================================================================

/// Per-execution values shared by every step of one run.
#[derive(Clone)]
struct ExecutionScope {
    steps: Arc<[StepDescriptor]>,
    collectors: Arc<[Option<MetricsCollector>]>,
    resources: Arc<Resources>,
}

impl ExecutionScope {
    fn mode(&self, index: usize) -> ExecutionMode {
        self.steps
            .get(index)
            .map_or(ExecutionMode::Sequential, |step| step.execution)
    }

    fn context(&self, step: &Arc<str>, state: PipelineState) -> StepContext {
        StepContext::new(Arc::clone(step), state, Arc::clone(&self.resources))
    }

    fn instrument<T: Send + 'static>(&self, index: usize, output: Sequence<T>) -> Sequence<T> {
        match self.collectors.get(index).and_then(Option::clone) {
            Some(collector) => wrap_with_metrics(output, collector),
            None => output,
        }
    }
}

type ChainFactory<In, Cur> =
    Arc<dyn Fn(&ExecutionScope) -> Transform<Envelope<In>, Envelope<Cur>> + Send + Sync>;

fn failed<T: Send + 'static>(err: FlowliteError) -> Sequence<T> {
    Sequence::from_results([Err(err)])
}

/// Run `f` per item sequentially or through the parallel window.
fn apply_mode<T, U, F, Fut>(input: Sequence<T>, mode: ExecutionMode, f: F) -> Sequence<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = FlowliteResult<U>> + Send + 'static,
{
    match mode {
        ExecutionMode::Sequential => input.transform(f),
        ExecutionMode::Parallel {
            concurrency,
            ordered,
        } => input
            .parallel_transform(f, ParallelOptions { concurrency, ordered })
            .unwrap_or_else(failed),
    }
}

/// Record each item's value under `step` and pass it on.
fn recorder<T>(step: Arc<str>) -> impl FnMut(Envelope<T>) -> Envelope<T> + Send + 'static
where
    T: Clone + Send + Sync + 'static,
{
    move |mut envelope| {
        envelope
            .state
            .record(Arc::clone(&step), envelope.value.clone());
        envelope
    }
}

// ============================================================================
// BUILDER
// ============================================================================

struct PendingStep {
    name: Arc<str>,
    options: StepOptions,
}

/// Fluent construction of a [`Pipeline`] from `In` to `Cur`.
///
/// Construction errors (empty or duplicate step names, zero sizes, invalid
/// options) are collected as steps are added and reported by
/// [`build`](Self::build), before anything runs.
pub struct PipelineBuilder<In, Cur> {
    options: PipelineOptions,
    resources: Resources,
    steps: Vec<PendingStep>,
    names: HashSet<Arc<str>>,
    errors: Vec<FlowliteError>,
    chain: ChainFactory<In, Cur>,
}

impl<In: Send + 'static> PipelineBuilder<In, In> {
    pub fn new() -> Self {
        Self {
            options: PipelineOptions::default(),
            resources: Resources::new(),
            steps: Vec::new(),
            names: HashSet::new(),
            errors: Vec::new(),
            chain: Arc::new(|_: &ExecutionScope| compose::identity()),
        }
    }
}

impl<In: Send + 'static> Default for PipelineBuilder<In, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Cur> fmt::Debug for PipelineBuilder<In, Cur> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

impl<In, Cur> PipelineBuilder<In, Cur>
where
    In: Send + 'static,
    Cur: Clone + Send + Sync + 'static,
{
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Make `resource` available to every step through [`StepContext::resource`].
    pub fn with_resource<R: Any + Send + Sync>(mut self, resource: R) -> Self {
        self.resources.insert(resource);
        self
    }

    fn register(&mut self, name: &str, options: StepOptions) -> (usize, Arc<str>) {
        let name: Arc<str> = Arc::from(name);
        if name.trim().is_empty() {
            self.errors.push(FlowliteError::InvalidArgument(
                "step name must not be empty".into(),
            ));
        } else if !self.names.insert(Arc::clone(&name)) {
            self.errors.push(FlowliteError::DuplicateStep(name.to_string()));
        }
        if let Err(e) = options.validate() {
            self.errors.push(e);
        }

        self.steps.push(PendingStep {
            name: Arc::clone(&name),
            options,
        });
        (self.steps.len() - 1, name)
    }

    fn push<Next, F>(self, index: usize, step: F) -> PipelineBuilder<In, Next>
    where
        Next: Send + 'static,
        F: Fn(Sequence<Envelope<Cur>>, &ExecutionScope) -> Sequence<Envelope<Next>>
            + Send
            + Sync
            + 'static,
    {
        let PipelineBuilder {
            options,
            resources,
            steps,
            names,
            errors,
            chain,
        } = self;
        let step = Arc::new(step);

        PipelineBuilder {
            options,
            resources,
            steps,
            names,
            errors,
            chain: Arc::new(move |scope: &ExecutionScope| {
                let step = Arc::clone(&step);
                let scope = scope.clone();
                chain(&scope).then(Transform::new(move |input| {
                    scope.instrument(index, step(input, &scope))
                }))
            }),
        }
    }

    /// Add a stage. Its output is recorded in the item state under the stage's name.
    pub fn add_step<Next>(
        mut self,
        stage: Stage<Cur, Next>,
        options: StepOptions,
    ) -> PipelineBuilder<In, Next>
    where
        Next: Clone + Send + Sync + 'static,
    {
        let (index, name) = self.register(stage.name(), options);
        if let Some(Err(e)) = stage.retry_policy().map(|policy| policy.validate()) {
            self.errors.push(e);
        }
        let stage = Arc::new(stage);

        self.push(index, move |input, scope| {
            let stage = Arc::clone(&stage);
            let name = Arc::clone(&name);
            let scope_for_items = scope.clone();
            apply_mode(input, scope.mode(index), move |envelope: Envelope<Cur>| {
                let stage = Arc::clone(&stage);
                let name = Arc::clone(&name);
                let ctx = scope_for_items.context(&name, envelope.state.clone());
                async move {
                    let Envelope { value, mut state } = envelope;
                    let output = execute_with_retry(&stage, value, &ctx).await?;
                    drop(ctx);
                    state.record(name, output.clone());
                    Ok(Envelope {
                        value: output,
                        state,
                    })
                }
            })
        })
    }

    /// Add an async function as a step, without retries.
    pub fn map_step<Next, F, Fut>(
        self,
        name: &str,
        f: F,
        options: StepOptions,
    ) -> PipelineBuilder<In, Next>
    where
        Next: Clone + Send + Sync + 'static,
        F: Fn(Cur, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Next>> + Send + 'static,
    {
        self.add_step(Stage::from_fn(name, f), options)
    }

    /// Keep items for which `predicate` resolves to `true`. Input order is
    /// preserved in parallel mode too.
    pub fn filter_step<F, Fut>(mut self, name: &str, predicate: F, options: StepOptions) -> Self
    where
        F: Fn(Cur, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let (index, name) = self.register(name, options);
        let stage = Arc::new(Stage::from_fn(name.to_string(), predicate));

        self.push(index, move |input, scope| {
            let stage = Arc::clone(&stage);
            let name = Arc::clone(&name);
            let scope_for_items = scope.clone();
            let keep = move |envelope: Envelope<Cur>| {
                let stage = Arc::clone(&stage);
                let name = Arc::clone(&name);
                let ctx = scope_for_items.context(&name, envelope.state.clone());
                async move {
                    let passed = execute_with_retry(&stage, envelope.value.clone(), &ctx).await?;
                    drop(ctx);
                    Ok(passed.then(|| recorder(name)(envelope)))
                }
            };

            match scope.mode(index) {
                ExecutionMode::Sequential => input.expand(keep),
                ExecutionMode::Parallel { concurrency, .. } => {
                    run_window(input, keep, concurrency, true)
                }
            }
        })
    }

    /// Map each item to zero or more outputs, flattened in input order.
    ///
    /// Every output starts from a copy of its parent's state.
    pub fn flat_map_step<Next, I, F, Fut>(
        mut self,
        name: &str,
        f: F,
        options: StepOptions,
    ) -> PipelineBuilder<In, Next>
    where
        Next: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = Next> + Send + 'static,
        F: Fn(Cur, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<I>> + Send + 'static,
    {
        let (index, name) = self.register(name, options);
        let stage = Arc::new(Stage::from_fn(name.to_string(), f));

        self.push(index, move |input, scope| {
            let stage = Arc::clone(&stage);
            let name = Arc::clone(&name);
            let scope_for_items = scope.clone();
            let expand = move |envelope: Envelope<Cur>| {
                let stage = Arc::clone(&stage);
                let name = Arc::clone(&name);
                let ctx = scope_for_items.context(&name, envelope.state.clone());
                async move {
                    let Envelope { value, state } = envelope;
                    let outputs = execute_with_retry(&stage, value, &ctx).await?;
                    drop(ctx);
                    Ok(outputs
                        .into_iter()
                        .map(|value| {
                            let mut state = state.clone();
                            state.record(Arc::clone(&name), value.clone());
                            Envelope { value, state }
                        })
                        .collect::<Vec<_>>())
                }
            };

            match scope.mode(index) {
                ExecutionMode::Sequential => input.expand(expand),
                ExecutionMode::Parallel {
                    concurrency,
                    ordered,
                } => input
                    .parallel_transform(expand, ParallelOptions { concurrency, ordered })
                    .map(|groups| groups.expand(|group| future::ready(Ok(group))))
                    .unwrap_or_else(failed),
            }
        })
    }

    /// Group items into vectors of `size`.
    ///
    /// A batch carries the state of its first member plus the batch itself.
    pub fn batch_step(mut self, name: &str, size: usize) -> PipelineBuilder<In, Vec<Cur>> {
        let (index, name) = self.register(name, StepOptions::sequential());
        if size == 0 {
            self.errors.push(FlowliteError::InvalidArgument(format!(
                "batch step '{name}': size must be a positive integer"
            )));
        }

        self.push(index, move |input, _scope| {
            let name = Arc::clone(&name);
            let batches = match input.batch(size) {
                Ok(batches) => batches,
                Err(e) => return failed(e),
            };
            batches.map(move |group: Vec<Envelope<Cur>>| {
                let mut state = None;
                let mut values = Vec::with_capacity(group.len());
                for envelope in group {
                    if state.is_none() {
                        state = Some(envelope.state);
                    }
                    values.push(envelope.value);
                }
                let mut state = state.unwrap_or_default();
                state.record(Arc::clone(&name), values.clone());
                Envelope {
                    value: values,
                    state,
                }
            })
        })
    }

    /// Call `f` on each item as a side effect.
    pub fn tap_step<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Cur, &StepContext) + Send + Sync + 'static,
    {
        let (index, name) = self.register(name, StepOptions::sequential());
        let f = Arc::new(f);

        self.push(index, move |input, scope| {
            let f = Arc::clone(&f);
            let scope = scope.clone();
            let mut record = recorder(Arc::clone(&name));
            let name = Arc::clone(&name);
            input.map(move |envelope: Envelope<Cur>| {
                let ctx = scope.context(&name, envelope.state.clone());
                f(&envelope.value, &ctx);
                drop(ctx);
                record(envelope)
            })
        })
    }

    /// Pass at most `n` items, then close everything upstream.
    pub fn take_step(mut self, name: &str, n: usize) -> Self {
        let (index, name) = self.register(name, StepOptions::sequential());
        self.push(index, move |input, _scope| {
            input.limit(n).map(recorder(Arc::clone(&name)))
        })
    }

    /// Drop the first `n` items.
    pub fn skip_step(mut self, name: &str, n: usize) -> Self {
        let (index, name) = self.register(name, StepOptions::sequential());
        self.push(index, move |input, _scope| {
            input.skip(n).map(recorder(Arc::clone(&name)))
        })
    }

    /// Drop items while `predicate` holds; everything after the first miss passes.
    pub fn skip_while_step<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: Fn(&Cur, &StepContext) -> bool + Send + Sync + 'static,
    {
        let (index, name) = self.register(name, StepOptions::sequential());
        let predicate = Arc::new(predicate);

        self.push(index, move |input, scope| {
            let predicate = Arc::clone(&predicate);
            let scope = scope.clone();
            let step = Arc::clone(&name);
            input
                .skip_while(move |envelope: &Envelope<Cur>| {
                    let ctx = scope.context(&step, envelope.state.clone());
                    future::ready(Ok(predicate(&envelope.value, &ctx)))
                })
                .map(recorder(Arc::clone(&name)))
        })
    }

    /// Validate the recorded steps and options.
    pub fn build(self) -> FlowliteResult<Pipeline<In, Cur>> {
        self.options.sanitize()?;

        let mut errors = self.errors.into_iter();
        if let Some(first) = errors.next() {
            for other in errors {
                tracing::debug!(error = %other, "Additional pipeline construction error");
            }
            return Err(first);
        }

        let default_concurrency = self.options.default_concurrency;
        let steps: Arc<[StepDescriptor]> = self
            .steps
            .iter()
            .map(|step| StepDescriptor {
                name: Arc::clone(&step.name),
                execution: step.options.resolve(default_concurrency),
            })
            .collect();

        tracing::debug!(
            steps = steps.len(),
            collect_metrics = self.options.collect_metrics,
            "Pipeline built"
        );

        Ok(Pipeline {
            options: self.options,
            steps,
            resources: Arc::new(self.resources),
            chain: self.chain,
        })
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// A validated, reusable chain of named steps.
pub struct Pipeline<In, Out> {
    options: PipelineOptions,
    steps: Arc<[StepDescriptor]>,
    resources: Arc<Resources>,
    chain: ChainFactory<In, Out>,
}

impl<In, Out> fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.name.as_ref())
    }

    pub fn execution_mode(&self, step: &str) -> Option<ExecutionMode> {
        self.steps
            .iter()
            .find(|s| s.name.as_ref() == step)
            .map(|s| s.execution)
    }

    /// Wire `source` through every step. Nothing is pulled until the returned
    /// run is consumed.
    pub fn run(&self, source: Sequence<In>) -> PipelineRun<Out> {
        let execution_id = Uuid::new_v4();
        let collectors: Arc<[Option<MetricsCollector>]> = self
            .steps
            .iter()
            .map(|_| {
                self.options
                    .collect_metrics
                    .then(|| MetricsCollector::new(&self.options.metrics))
            })
            .collect();

        let scope = ExecutionScope {
            steps: Arc::clone(&self.steps),
            collectors: Arc::clone(&collectors),
            resources: Arc::clone(&self.resources),
        };

        tracing::debug!(
            execution_id = %execution_id,
            steps = self.steps.len(),
            "Starting pipeline execution"
        );

        let output = (self.chain)(&scope).apply(source.map(Envelope::new));
        PipelineRun {
            monitor: RunMonitor::new(execution_id, Arc::clone(&self.steps), collectors),
            output,
        }
    }

    /// Drain into an ordered list.
    pub async fn execute_to_array(&self, source: Sequence<In>) -> FlowliteResult<Vec<Out>> {
        let run = self.run(source);
        let monitor = run.monitor();
        let result = run.into_sequence().to_vec().await;
        log_outcome(&monitor, &result);
        result
    }

    /// Fold the output left to right.
    pub async fn reduce<A, F>(&self, source: Sequence<In>, init: A, reducer: F) -> FlowliteResult<A>
    where
        F: FnMut(A, Out) -> A,
    {
        let run = self.run(source);
        let monitor = run.monitor();
        let result = run.into_sequence().reduce(init, reducer).await;
        log_outcome(&monitor, &result);
        result
    }

    /// Drive the pipeline for side effects. An `Err` from `f` stops the run and
    /// closes every step upstream.
    pub async fn for_each<F>(&self, source: Sequence<In>, f: F) -> FlowliteResult<()>
    where
        F: FnMut(Out, usize) -> FlowliteResult<()>,
    {
        let run = self.run(source);
        let monitor = run.monitor();
        let result = run.into_sequence().for_each(f).await;
        log_outcome(&monitor, &result);
        result
    }

    /// Drain into a list and return it with the final per-step metrics.
    pub async fn execute_with_metrics(
        &self,
        source: Sequence<In>,
    ) -> FlowliteResult<(Vec<Out>, PipelineMetrics)> {
        let run = self.run(source);
        let monitor = run.monitor();
        let result = run.into_sequence().to_vec().await;
        log_outcome(&monitor, &result);
        Ok((result?, monitor.snapshot()))
    }
}

fn log_outcome<T>(monitor: &RunMonitor, result: &FlowliteResult<T>) {
    match result {
        Ok(_) => tracing::debug!(
            execution_id = %monitor.execution_id(),
            "Pipeline execution finished"
        ),
        Err(e) => tracing::debug!(
            execution_id = %monitor.execution_id(),
            step = e.step_failure().map(|f| f.step.as_str()),
            error = %e,
            "Pipeline execution failed"
        ),
    }
}

/// One lazy execution of a [`Pipeline`].
pub struct PipelineRun<Out> {
    monitor: RunMonitor,
    output: Sequence<Envelope<Out>>,
}

impl<Out: Send + 'static> PipelineRun<Out> {
    pub fn execution_id(&self) -> Uuid {
        self.monitor.execution_id()
    }

    /// Metrics so far; valid while the run is still being consumed.
    pub fn metrics(&self) -> PipelineMetrics {
        self.monitor.snapshot()
    }

    /// Handle that outlives the run's output sequence.
    pub fn monitor(&self) -> RunMonitor {
        self.monitor.clone()
    }

    /// Output items together with their accumulated state.
    pub fn into_envelopes(self) -> Sequence<Envelope<Out>> {
        self.output
    }

    pub fn into_sequence(self) -> Sequence<Out> {
        self.output.map(Envelope::into_value)
    }
}

impl<Out> fmt::Debug for PipelineRun<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("execution_id", &self.monitor.execution_id())
            .finish_non_exhaustive()
    }
}
