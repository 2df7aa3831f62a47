//! Immutable stage descriptors and the graph nodes behind them.

use super::behavior::{Behavior, Hooks};
use super::drain::{self, Drain};
use super::network::{InputEdge, MergedInput, Outputs, Plan};
use super::worker;
use crate::context::RunContext;
use crate::core::{StageKind, Substrate};
use crate::errors::{PipelineError, PipelineValidationError, SOURCE_CONSUMED};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Values that can flow between stages.
///
/// Items are cloned once per extra downstream edge when a stage fans out, and
/// moved between workers that may live on other threads.
pub trait Item: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Item for T {}

/// Process-unique identifier of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(u64);

impl StageId {
    /// The pseudo-stage a drain registers its own input under.
    pub const DRAIN: Self = Self(0);

    fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::DRAIN {
            write!(f, "drain")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// The static configuration of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique id.
    pub id: StageId,
    /// Display name, `"{kind}-{id}"` unless set explicitly.
    pub name: String,
    /// Per-item behavior.
    pub kind: StageKind,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Capacity of each output edge; 0 is unbounded.
    pub capacity: usize,
    /// Where the workers run.
    pub substrate: Substrate,
}

impl StageConfig {
    /// Creates a configuration with a fresh id and the default name.
    #[must_use]
    pub fn new(kind: StageKind, workers: usize, capacity: usize, substrate: Substrate) -> Self {
        let id = StageId::next();
        Self {
            id,
            name: format!("{kind}-{}", id.get()),
            kind,
            workers,
            capacity,
            substrate,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A node of the stage graph.
///
/// `prepare` runs once per node per run. It wires the node's input edges
/// (recursively preparing its upstream nodes) and registers a launcher that
/// spawns the node's workers once every output edge is known.
pub(crate) trait Node<T: Item>: Send + Sync {
    fn config(&self) -> &StageConfig;

    fn upstream(&self) -> Vec<StageConfig>;

    fn prepare(self: Arc<Self>, plan: &mut Plan) -> Result<(), PipelineError>;
}

/// An immutable pipeline stage producing items of type `T`.
///
/// Cloning a stage is cheap and yields the same node, so one stage can feed
/// several downstream stages. Stages are built with the functions in
/// [`pipeline`](crate::pipeline) and never change after construction.
pub struct Stage<T: Item> {
    pub(crate) node: Arc<dyn Node<T>>,
}

impl<T: Item> Stage<T> {
    pub(crate) fn from_node(node: Arc<dyn Node<T>>) -> Self {
        Self { node }
    }

    /// Returns the stage configuration.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        self.node.config()
    }

    /// Returns the stage id.
    #[must_use]
    pub fn id(&self) -> StageId {
        self.config().id
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config().name
    }

    /// Returns the stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.config().kind
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.config().workers
    }

    /// Returns the configurations of the direct upstream stages.
    #[must_use]
    pub fn dependencies(&self) -> Vec<StageConfig> {
        self.node.upstream()
    }

    /// Starts the pipeline and returns a lazy drain over this stage's output.
    pub fn to_iterable(&self) -> Result<Drain<T>, PipelineError> {
        drain::to_iterable(self.clone())
    }

    /// Runs the pipeline to completion and collects its output.
    ///
    /// Output order is only preserved when every stage has one worker.
    pub fn to_vec(&self) -> Result<Vec<T>, PipelineError> {
        self.to_iterable()?.collect()
    }

    /// Runs the pipeline to completion, discarding its output.
    pub fn run(&self) -> Result<(), PipelineError> {
        drain::run(self.clone())
    }
}

impl<T: Item> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T: Item> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("config", self.config())
            .field(
                "dependencies",
                &self.dependencies().iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<T: Item> From<&Stage<T>> for Stage<T> {
    fn from(stage: &Stage<T>) -> Self {
        stage.clone()
    }
}

impl<T: Item> From<Vec<T>> for Stage<T> {
    fn from(items: Vec<T>) -> Self {
        super::builder::from_iterable(items).build()
    }
}

/// A stage whose workers pull from upstream stages.
pub(crate) struct WorkerNode<I: Item, O: Item> {
    pub(crate) config: StageConfig,
    pub(crate) behavior: Behavior<I, O>,
    pub(crate) hooks: Hooks,
    pub(crate) dependencies: Vec<Stage<I>>,
}

impl<I: Item, O: Item> Node<O> for WorkerNode<I, O> {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn upstream(&self) -> Vec<StageConfig> {
        self.dependencies.iter().map(|d| d.config().clone()).collect()
    }

    fn prepare(self: Arc<Self>, plan: &mut Plan) -> Result<(), PipelineError> {
        let mut edges = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            let rx = plan.connect(&dependency.node, self.config.id)?;
            edges.push(InputEdge::new(dependency.config(), rx));
        }

        let expected_done = edges.iter().map(InputEdge::expected_done).sum();
        let counters = plan.stats().register(&self.config, expected_done);
        let input = MergedInput::new(edges, counters);

        let config = self.config.clone();
        plan.add_launcher(
            &config,
            Box::new(move |outputs: &mut Outputs, ctx: &RunContext| {
                let fanout = outputs.take::<O>(&self.config, ctx)?;
                Ok(worker::spawn_stage(&self, input, fanout, ctx))
            }),
        );
        Ok(())
    }
}

pub(crate) type BoxIter<T> = Box<dyn Iterator<Item = T> + Send>;

/// Where a source stage gets its items from.
pub(crate) enum SourceOrigin<T> {
    /// Opens a fresh iterator for every run.
    Replayable(Mutex<Box<dyn Fn() -> BoxIter<T> + Send>>),
    /// A single iterator, consumed by the first run.
    Once(Mutex<Option<BoxIter<T>>>),
}

impl<T: Item> SourceOrigin<T> {
    fn open(&self, config: &StageConfig) -> Result<BoxIter<T>, PipelineValidationError> {
        match self {
            Self::Replayable(open) => Ok((*open.lock())()),
            Self::Once(slot) => slot.lock().take().ok_or_else(|| {
                PipelineValidationError::contract(
                    SOURCE_CONSUMED,
                    format!("source '{}' was already consumed by an earlier run", config.name),
                )
                .with_stages(vec![config.name.clone()])
            }),
        }
    }

    /// Hands back an iterator that was opened but never launched.
    fn restore(&self, items: BoxIter<T>) {
        if let Self::Once(slot) = self {
            *slot.lock() = Some(items);
        }
    }
}

/// A stage with no upstream stages; its single worker drains an iterator.
pub(crate) struct SourceNode<T: Item> {
    pub(crate) config: StageConfig,
    pub(crate) origin: SourceOrigin<T>,
}

impl<T: Item> Node<T> for SourceNode<T> {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn upstream(&self) -> Vec<StageConfig> {
        Vec::new()
    }

    fn prepare(self: Arc<Self>, plan: &mut Plan) -> Result<(), PipelineError> {
        let staged = Arc::new(Mutex::new(Some(self.origin.open(&self.config)?)));
        plan.stats().register(&self.config, 0);

        // A run that fails before this source launches returns its iterator.
        let node = Arc::clone(&self);
        let unused = Arc::clone(&staged);
        plan.add_rollback(Box::new(move || {
            if let Some(items) = unused.lock().take() {
                node.origin.restore(items);
            }
        }));

        let config = self.config.clone();
        plan.add_launcher(
            &config,
            Box::new(move |outputs: &mut Outputs, ctx: &RunContext| {
                let fanout = outputs.take::<T>(&self.config, ctx)?;
                let items = staged.lock().take().ok_or_else(|| {
                    PipelineError::Internal(format!("source '{}' launched twice", self.config.name))
                })?;
                Ok(worker::spawn_source(&self.config, items, fanout, ctx))
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{concat, from_iter_once, from_iterable, map};

    #[test]
    fn test_stage_ids_are_unique() {
        let a = StageConfig::new(StageKind::Transform, 1, 0, Substrate::Thread);
        let b = StageConfig::new(StageKind::Transform, 1, 0, Substrate::Thread);
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, StageId::DRAIN);
        assert_eq!(a.name, format!("map-{}", a.id.get()));
        assert_eq!(StageId::DRAIN.to_string(), "drain");
    }

    #[test]
    fn test_stage_is_immutable_when_branching() {
        let source: Stage<i32> = vec![1, 2, 3].into();
        let left = map(|x: i32| Ok(x + 1), &source).with_name("left").build().unwrap();
        let right = map(|x: i32| Ok(x * 2), &source).with_name("right").build().unwrap();

        assert_eq!(source.kind(), StageKind::Source);
        assert!(source.dependencies().is_empty());
        assert_eq!(left.dependencies()[0].id, source.id());
        assert_eq!(right.dependencies()[0].id, source.id());
        assert_eq!(left.name(), "left");
    }

    #[test]
    fn test_replayable_source_opens_twice() {
        let source = from_iterable(vec![1, 2]).build();
        assert_eq!(source.to_vec().unwrap(), vec![1, 2]);
        assert_eq!(source.to_vec().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_once_source_rejects_second_run() {
        let source = from_iter_once(vec![1, 2].into_iter()).build();
        assert_eq!(source.to_vec().unwrap(), vec![1, 2]);

        let err = source.to_vec().unwrap_err();
        assert_eq!(err.code(), Some(SOURCE_CONSUMED));
    }

    #[test]
    fn test_failed_wiring_keeps_once_source_unconsumed() {
        let fresh = from_iter_once(vec![1, 2, 3]).with_name("fresh").build();
        let used = from_iter_once(vec![9]).with_name("used").build();
        assert_eq!(used.to_vec().unwrap(), vec![9]);

        let err = concat([fresh.clone(), used]).to_vec().unwrap_err();
        assert_eq!(err.code(), Some(SOURCE_CONSUMED));
        assert!(err.to_string().contains("'used'"));

        assert_eq!(fresh.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_once_source_is_consumed_by_a_successful_run() {
        let source = from_iter_once(vec![4, 5]).with_name("single").build();
        let doubled = map(|x: i32| Ok(x * 2), &source).build().unwrap();
        assert_eq!(doubled.to_vec().unwrap(), vec![8, 10]);

        let err = source.to_vec().unwrap_err();
        assert!(err.to_string().contains("'single'"));
    }
}
