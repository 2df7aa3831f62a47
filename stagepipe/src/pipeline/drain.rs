//! Starting a pipeline and pulling its output.

use super::builder::concat;
use super::network::{InputEdge, MergedInput, Plan, Received};
use super::stage::{Item, Stage, StageId};
use super::worker::WorkerHandle;
use crate::config::{RunConfig, TaskRuntime};
use crate::context::RunContext;
use crate::errors::{
    FailureDescriptor, FailureKind, PipelineError, PipelineValidationError, StageFailure, NO_RUNTIME,
};
use crate::events::names;
use crate::observability::{RunStats, SpanTimer};
use futures::Stream;
use serde_json::json;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A lazy, single-pass view of a running pipeline's output.
///
/// Each pull blocks until the terminal stage emits an item, its input is
/// exhausted, or the run fails. A recorded failure is raised once, at the
/// pull that observes it; afterwards the drain stays ended. Items already
/// returned before the failure remain valid.
///
/// Dropping a drain before it ends cancels the run.
pub struct Drain<T: Item> {
    input: MergedInput<T>,
    ctx: RunContext,
    workers: Vec<WorkerHandle>,
    runtime: Option<Runtime>,
    grace: Duration,
    timer: SpanTimer,
    yielded: usize,
    finished: bool,
    exhausted: bool,
}

/// Starts the pipeline ending at `stage` with the default configuration.
pub fn to_iterable<T: Item>(stage: impl Into<Stage<T>>) -> Result<Drain<T>, PipelineError> {
    to_iterable_with(stage, &RunConfig::default())
}

/// Starts the pipeline ending at `stage`.
///
/// Wires the queue network for every stage reachable from `stage`, spawns
/// all workers and returns the drain. Structural errors are returned here,
/// before any worker starts.
pub fn to_iterable_with<T: Item>(
    stage: impl Into<Stage<T>>,
    config: &RunConfig,
) -> Result<Drain<T>, PipelineError> {
    config.validate()?;
    let stage = stage.into();
    let mut ctx = RunContext::new(Arc::clone(&config.events));

    let mut plan = Plan::new(Arc::clone(&ctx.stats));
    let rx = plan.connect(&stage.node, StageId::DRAIN)?;
    let counters = ctx.stats.register_drain(stage.workers());
    let input = MergedInput::new(vec![InputEdge::new(stage.config(), rx)], counters);

    let runtime = if plan.uses_tasks() {
        match config.runtime {
            TaskRuntime::Dedicated => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.task_threads)
                    .thread_name("stagepipe-task")
                    .enable_all()
                    .build()?;
                ctx.tasks = Some(runtime.handle().clone());
                Some(runtime)
            }
            TaskRuntime::Current => {
                let handle = Handle::try_current().map_err(|_| {
                    PipelineValidationError::contract(
                        NO_RUNTIME,
                        "task workers need a tokio runtime when TaskRuntime::Current is selected",
                    )
                })?;
                ctx.tasks = Some(handle);
                None
            }
        }
    } else {
        None
    };

    info!(
        run_id = %ctx.run_id,
        stage = %stage.name(),
        stages = ctx.stats.len() - 1,
        "starting pipeline"
    );
    ctx.emit(
        names::PIPELINE_STARTED,
        json!({ "stage": stage.name(), "stages": ctx.stats.len() - 1 }),
    );

    let workers = match plan.launch(&ctx) {
        Ok(workers) => workers,
        Err(err) => {
            ctx.state.cancel();
            if let Some(runtime) = runtime {
                runtime.shutdown_background();
            }
            return Err(err);
        }
    };

    Ok(Drain {
        input,
        ctx,
        workers,
        runtime,
        grace: config.shutdown_grace(),
        timer: SpanTimer::start("drain"),
        yielded: 0,
        finished: false,
        exhausted: false,
    })
}

/// Runs the pipeline ending at `stage` to completion, discarding its output.
pub fn run<T: Item>(stage: impl Into<Stage<T>>) -> Result<(), PipelineError> {
    run_with(stage, &RunConfig::default())
}

/// Like [`run`], with an explicit configuration.
pub fn run_with<T: Item>(stage: impl Into<Stage<T>>, config: &RunConfig) -> Result<(), PipelineError> {
    for item in to_iterable_with(stage, config)? {
        item?;
    }
    Ok(())
}

/// Merges `stages` and runs them to completion, discarding their output.
pub fn run_all<T: Item>(stages: impl IntoIterator<Item = Stage<T>>) -> Result<(), PipelineError> {
    run_all_with(stages, &RunConfig::default())
}

/// Like [`run_all`], with an explicit configuration.
pub fn run_all_with<T: Item>(
    stages: impl IntoIterator<Item = Stage<T>>,
    config: &RunConfig,
) -> Result<(), PipelineError> {
    let merged = concat(stages).with_capacity(config.capacity).build()?;
    run_with(merged, config)
}

impl<T: Item> Drain<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the output is exhausted or the run was cancelled,
    /// and `Some(Err(_))` exactly once if a failure was recorded.
    pub async fn recv(&mut self) -> Option<Result<T, PipelineError>> {
        if self.finished {
            return None;
        }
        match self.input.recv(&self.ctx.state).await {
            Received::Item(item) => {
                self.yielded += 1;
                return Some(Ok(item));
            }
            Received::Exhausted => {
                self.exhausted = true;
                self.join_tasks().await;
            }
            Received::Stopped => {}
            Received::Disconnected { producer } => {
                self.ctx.fail(StageFailure::new(
                    producer,
                    None,
                    FailureKind::Disconnected,
                    anyhow::anyhow!("output edge closed before every worker finished"),
                ));
            }
        }
        self.finish().await
    }

    /// Waits for task workers, which have all sent their Done tokens by now.
    async fn join_tasks(&mut self) {
        let mut threads = Vec::new();
        for worker in std::mem::take(&mut self.workers) {
            match worker {
                WorkerHandle::Task(handle) => {
                    if let Err(err) = handle.await {
                        warn!(run_id = %self.ctx.run_id, error = %err, "task worker did not finish cleanly");
                    }
                }
                thread @ WorkerHandle::Thread(_) => threads.push(thread),
            }
        }
        self.workers = threads;
    }

    async fn finish(&mut self) -> Option<Result<T, PipelineError>> {
        self.finished = true;
        let elapsed_ms = self.timer.elapsed_ms();
        let summary = json!({ "items": self.yielded, "elapsed_ms": elapsed_ms });

        if let Some(failure) = self.ctx.state.take_failure() {
            warn!(
                run_id = %self.ctx.run_id,
                stage = %failure.descriptor.stage,
                items = self.yielded,
                elapsed_ms,
                "pipeline failed"
            );
            self.ctx.publish(names::PIPELINE_FAILED, summary).await;
            return Some(Err(failure.into()));
        }

        if self.ctx.state.is_cancelled() {
            debug!(run_id = %self.ctx.run_id, items = self.yielded, "pipeline cancelled");
            self.ctx.publish(names::PIPELINE_CANCELLED, summary).await;
        } else {
            info!(run_id = %self.ctx.run_id, items = self.yielded, elapsed_ms, "pipeline completed");
            self.ctx.publish(names::PIPELINE_COMPLETED, summary).await;
        }
        None
    }

    /// Stops every worker at its next suspension point.
    ///
    /// The drain then ends without raising.
    pub fn cancel(&self) {
        self.ctx.state.cancel();
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// Returns the run's per-stage counters.
    #[must_use]
    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Returns the descriptor of the recorded failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<FailureDescriptor> {
        self.ctx.state.failure()
    }

    /// Returns true once the drain has ended.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Converts the drain into an async stream of items.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, PipelineError>> + Send {
        futures::stream::unfold(self, |mut drain| async move {
            drain.recv().await.map(|item| (item, drain))
        })
    }
}

impl<T: Item> Iterator for Drain<T> {
    type Item = Result<T, PipelineError>;

    /// Blocks the calling thread until the next item.
    fn next(&mut self) -> Option<Self::Item> {
        futures::executor::block_on(self.recv())
    }
}

impl<T: Item> FusedIterator for Drain<T> {}

impl<T: Item> Drop for Drain<T> {
    fn drop(&mut self) {
        if !self.finished {
            self.ctx.state.cancel();
            debug!(run_id = %self.ctx.run_id, items = self.yielded, "drain dropped, cancelling");
            self.ctx.emit(names::PIPELINE_CANCELLED, json!({ "items": self.yielded }));
        }

        let workers = std::mem::take(&mut self.workers);
        if self.exhausted {
            // Task workers were awaited by `recv`; only threads remain.
            for worker in workers {
                if let WorkerHandle::Thread(handle) = worker {
                    let _ = handle.join();
                }
            }
        }

        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(self.grace);
            }
        }
    }
}

impl<T: Item> std::fmt::Debug for Drain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drain")
            .field("run_id", &self.ctx.run_id)
            .field("yielded", &self.yielded)
            .field("finished", &self.finished)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}
