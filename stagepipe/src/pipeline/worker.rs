//! Worker spawning and the per-worker processing loops.

use super::behavior::guarded;
use super::network::{Delivery, Fanout, MergedInput, Received};
use super::stage::{BoxIter, Item, StageConfig, WorkerNode};
use crate::context::RunContext;
use crate::core::{StageStatus, Substrate, WorkerInfo};
use crate::errors::{FailureKind, StageFailure};
use crate::events::names;
use crate::observability::SpanTimer;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A spawned worker.
#[derive(Debug)]
pub(crate) enum WorkerHandle {
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

fn spawn<F>(config: &StageConfig, index: usize, ctx: &RunContext, worker: F) -> anyhow::Result<WorkerHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    match config.substrate {
        Substrate::Thread => {
            let handle = std::thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || futures::executor::block_on(worker))?;
            Ok(WorkerHandle::Thread(handle))
        }
        Substrate::Task => match &ctx.tasks {
            Some(runtime) => Ok(WorkerHandle::Task(runtime.spawn(worker))),
            None => Err(anyhow::anyhow!("no tokio runtime available for task workers")),
        },
    }
}

/// Spawns every worker of a stage.
///
/// A worker that cannot be spawned is recorded as a failure of the run, so
/// the workers already running stop instead of waiting for its Done tokens.
pub(crate) fn spawn_stage<I: Item, O: Item>(
    node: &Arc<WorkerNode<I, O>>,
    input: MergedInput<I>,
    fanout: Fanout<O>,
    ctx: &RunContext,
) -> Vec<WorkerHandle> {
    let config = &node.config;
    let input = Arc::new(Mutex::new(input));
    let mut handles = Vec::with_capacity(config.workers);

    for _ in 0..config.workers {
        fanout.counters().worker_started();
    }
    for index in 0..config.workers {
        let worker = run_worker(
            Arc::clone(node),
            index,
            Arc::clone(&input),
            fanout.clone(),
            ctx.clone(),
        );
        match spawn(config, index, ctx, worker) {
            Ok(handle) => handles.push(handle),
            Err(error) => {
                for _ in index..config.workers {
                    fanout.counters().worker_exited();
                }
                ctx.fail(StageFailure::new(&config.name, Some(index), FailureKind::Spawn, error));
                break;
            }
        }
    }
    handles
}

/// Spawns the single worker of a source stage.
pub(crate) fn spawn_source<T: Item>(
    config: &StageConfig,
    items: BoxIter<T>,
    fanout: Fanout<T>,
    ctx: &RunContext,
) -> Vec<WorkerHandle> {
    fanout.counters().worker_started();
    let worker = run_source(config.clone(), items, fanout.clone(), ctx.clone());
    match spawn(config, 0, ctx, worker) {
        Ok(handle) => vec![handle],
        Err(error) => {
            fanout.counters().worker_exited();
            ctx.fail(StageFailure::new(&config.name, Some(0), FailureKind::Spawn, error));
            Vec::new()
        }
    }
}

/// Records a failed put unless the run is already stopping.
fn undelivered(config: &StageConfig, index: usize, delivery: Delivery, ctx: &RunContext) {
    if delivery == Delivery::Disconnected && !ctx.state.should_stop() {
        ctx.fail(StageFailure::new(
            &config.name,
            Some(index),
            FailureKind::Disconnected,
            anyhow::anyhow!("downstream consumer went away before the run stopped"),
        ));
    }
}

async fn run_worker<I: Item, O: Item>(
    node: Arc<WorkerNode<I, O>>,
    index: usize,
    input: Arc<Mutex<MergedInput<I>>>,
    fanout: Fanout<O>,
    ctx: RunContext,
) {
    let config = &node.config;
    let timer = SpanTimer::start(format!("{}-{index}", config.name));
    let info = WorkerInfo {
        stage: config.name.clone(),
        index,
        workers: config.workers,
        substrate: config.substrate,
        run_id: ctx.run_id,
    };

    let bag = match node.hooks.start(&info) {
        Ok(bag) => Some(bag),
        Err(fault) => {
            ctx.fail(fault.into_failure(&config.name, Some(index), FailureKind::OnStart));
            None
        }
    };

    let mut processed = 0;
    if let Some(bag) = &bag {
        debug!(run_id = %ctx.run_id, stage = %config.name, worker = index, "worker started");
        ctx.publish(names::WORKER_STARTED, json!({ "stage": config.name, "worker": index }))
            .await;

        while !ctx.state.should_stop() {
            let received = input.lock().await.recv(&ctx.state).await;
            let item = match received {
                Received::Item(item) => item,
                Received::Exhausted | Received::Stopped => break,
                Received::Disconnected { producer } => {
                    ctx.fail(StageFailure::new(
                        &config.name,
                        Some(index),
                        FailureKind::Disconnected,
                        anyhow::anyhow!("upstream stage '{producer}' stopped without finishing"),
                    ));
                    break;
                }
            };
            processed += 1;

            match node.behavior.apply(item, bag, &fanout, &ctx.state).await {
                Ok(Delivery::Delivered) => {}
                Ok(delivery) => {
                    undelivered(config, index, delivery, &ctx);
                    break;
                }
                Err(fault) => {
                    let failure = fault.into_failure(&config.name, Some(index), FailureKind::WorkerFn);
                    let descriptor = failure.descriptor.clone();
                    ctx.fail(failure);
                    fanout.signal_failure(&descriptor);
                    break;
                }
            }
        }

        let status = StageStatus {
            stage: config.name.clone(),
            worker: index,
            items_processed: processed,
            active_workers: fanout.counters().worker_exited(),
            failed: ctx.state.is_failed(),
            elapsed_ms: timer.elapsed_ms(),
        };
        if let Err(fault) = node.hooks.done(&status, bag) {
            ctx.fail(fault.into_failure(&config.name, Some(index), FailureKind::OnDone));
        }
    } else {
        fanout.counters().worker_exited();
    }

    fanout.close(&ctx.state).await;
    let elapsed_ms = timer.finish();
    debug!(
        run_id = %ctx.run_id,
        stage = %config.name,
        worker = index,
        processed,
        elapsed_ms,
        "worker finished"
    );
    ctx.publish(
        names::WORKER_COMPLETED,
        json!({
            "stage": config.name,
            "worker": index,
            "items_processed": processed,
            "elapsed_ms": elapsed_ms,
        }),
    )
    .await;
}

async fn run_source<T: Item>(config: StageConfig, mut items: BoxIter<T>, fanout: Fanout<T>, ctx: RunContext) {
    let timer = SpanTimer::start(format!("{}-0", config.name));
    debug!(run_id = %ctx.run_id, stage = %config.name, "source started");
    ctx.publish(names::WORKER_STARTED, json!({ "stage": config.name, "worker": 0 }))
        .await;

    let mut produced = 0;
    while !ctx.state.should_stop() {
        let item = match guarded(|| Ok(items.next())) {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(fault) => {
                let failure = fault.into_failure(&config.name, Some(0), FailureKind::Source);
                let descriptor = failure.descriptor.clone();
                ctx.fail(failure);
                fanout.signal_failure(&descriptor);
                break;
            }
        };
        match fanout.put(item, &ctx.state).await {
            Delivery::Delivered => produced += 1,
            delivery => {
                undelivered(&config, 0, delivery, &ctx);
                break;
            }
        }
    }
    // Release whatever the iterator holds before announcing completion.
    drop(items);

    fanout.counters().worker_exited();
    fanout.close(&ctx.state).await;
    let elapsed_ms = timer.finish();
    debug!(run_id = %ctx.run_id, stage = %config.name, produced, elapsed_ms, "source finished");
    ctx.publish(
        names::WORKER_COMPLETED,
        json!({
            "stage": config.name,
            "worker": 0,
            "items_processed": produced,
            "elapsed_ms": elapsed_ms,
        }),
    )
    .await;
}
