//! Functions that build new stages from callables and existing stages.
//!
//! Every function returns a builder. Builders never touch the stages they
//! depend on, so one stage can be reused in as many pipelines as needed.
//!
//! ```rust,ignore
//! use stagepipe::prelude::*;
//!
//! let squares = map(|x: u64| Ok(x * x), from_iterable(0..100_u64))
//!     .with_workers(4)
//!     .with_capacity(16)
//!     .build()?;
//! let evens = filter(|x: &u64| Ok(x % 2 == 0), &squares).build()?;
//! let total: u64 = evens.to_vec()?.into_iter().sum();
//! ```

use super::behavior::{Behavior, Hooks};
use super::stage::{BoxIter, Item, SourceNode, SourceOrigin, Stage, StageConfig, WorkerNode};
use crate::core::{StageKind, StageStatus, Substrate, WorkerBag, WorkerInfo};
use crate::errors::{PipelineError, PipelineValidationError, EMPTY_RUN, ZERO_WORKERS};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for a stage that consumes `I` and produces `O`.
pub struct StageBuilder<I: Item, O: Item> {
    name: Option<String>,
    workers: usize,
    capacity: usize,
    substrate: Substrate,
    behavior: Behavior<I, O>,
    hooks: Hooks,
    dependencies: Vec<Stage<I>>,
}

impl<I: Item, O: Item> StageBuilder<I, O> {
    fn new(behavior: Behavior<I, O>, dependencies: Vec<Stage<I>>) -> Self {
        Self {
            name: None,
            workers: 1,
            capacity: 0,
            substrate: Substrate::default(),
            behavior,
            hooks: Hooks::default(),
            dependencies,
        }
    }

    /// Sets the stage name used in logs, events and errors.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the number of concurrent workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the capacity of each output edge; 0 is unbounded.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets where the workers run.
    #[must_use]
    pub fn with_substrate(mut self, substrate: Substrate) -> Self {
        self.substrate = substrate;
        self
    }

    /// Sets the hook run by each worker before it pulls its first item.
    #[must_use]
    pub fn with_on_start<F>(mut self, on_start: F) -> Self
    where
        F: Fn(&WorkerInfo) -> anyhow::Result<WorkerBag> + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(on_start));
        self
    }

    /// Sets the hook run by each worker after its loop ends.
    ///
    /// Not called for a worker whose `on_start` failed.
    #[must_use]
    pub fn with_on_done<F>(mut self, on_done: F) -> Self
    where
        F: Fn(&StageStatus, &WorkerBag) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_done = Some(Arc::new(on_done));
        self
    }

    /// Builds the stage.
    pub fn build(self) -> Result<Stage<O>, PipelineValidationError> {
        let mut config = StageConfig::new(self.behavior.kind(), self.workers, self.capacity, self.substrate);
        if let Some(name) = self.name {
            config.name = name;
        }

        if config.workers == 0 {
            return Err(PipelineValidationError::contract(
                ZERO_WORKERS,
                format!("stage '{}' must have at least one worker", config.name),
            )
            .with_stages(vec![config.name]));
        }
        if self.dependencies.is_empty() {
            return Err(PipelineValidationError::contract(
                EMPTY_RUN,
                format!("stage '{}' has no input stages", config.name),
            )
            .with_stages(vec![config.name]));
        }

        Ok(Stage::from_node(Arc::new(WorkerNode {
            config,
            behavior: self.behavior,
            hooks: self.hooks,
            dependencies: self.dependencies,
        })))
    }

    /// Builds the stage and runs it to completion, discarding its output.
    pub fn run(self) -> Result<(), PipelineError> {
        self.build()?.run()
    }

    /// Builds the stage and collects its output.
    pub fn to_vec(self) -> Result<Vec<O>, PipelineError> {
        self.build()?.to_vec()
    }
}

/// Builder for a source stage.
pub struct SourceBuilder<T: Item> {
    name: Option<String>,
    capacity: usize,
    substrate: Substrate,
    origin: SourceOrigin<T>,
}

impl<T: Item> SourceBuilder<T> {
    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bounds the source's output edges; 0 (the default) is unbounded.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets where the source worker runs.
    ///
    /// Keep the default thread substrate for iterators that block.
    #[must_use]
    pub fn with_substrate(mut self, substrate: Substrate) -> Self {
        self.substrate = substrate;
        self
    }

    /// Builds the stage. Sources always run exactly one worker.
    #[must_use]
    pub fn build(self) -> Stage<T> {
        let mut config = StageConfig::new(StageKind::Source, 1, self.capacity, self.substrate);
        if let Some(name) = self.name {
            config.name = name;
        }
        Stage::from_node(Arc::new(SourceNode {
            config,
            origin: self.origin,
        }))
    }
}

impl<T: Item> From<SourceBuilder<T>> for Stage<T> {
    fn from(builder: SourceBuilder<T>) -> Self {
        builder.build()
    }
}

/// Creates a source that re-iterates a clone of `iterable` on every run.
pub fn from_iterable<It>(iterable: It) -> SourceBuilder<It::Item>
where
    It: IntoIterator + Clone + Send + 'static,
    It::IntoIter: Send + 'static,
    It::Item: Item,
{
    let open: Box<dyn Fn() -> BoxIter<It::Item> + Send> =
        Box::new(move || Box::new(iterable.clone().into_iter()) as BoxIter<It::Item>);
    SourceBuilder {
        name: None,
        capacity: 0,
        substrate: Substrate::Thread,
        origin: SourceOrigin::Replayable(Mutex::new(open)),
    }
}

/// Creates a source from an iterator that can only be consumed once.
///
/// Running a pipeline that contains this source a second time fails with a
/// validation error.
pub fn from_iter_once<It>(iter: It) -> SourceBuilder<It::Item>
where
    It: IntoIterator,
    It::IntoIter: Send + 'static,
    It::Item: Item,
{
    let items: BoxIter<It::Item> = Box::new(iter.into_iter());
    SourceBuilder {
        name: None,
        capacity: 0,
        substrate: Substrate::Thread,
        origin: SourceOrigin::Once(Mutex::new(Some(items))),
    }
}

/// Applies `f` to every item and emits its result.
pub fn map<I, O, F>(f: F, stage: impl Into<Stage<I>>) -> StageBuilder<I, O>
where
    I: Item,
    O: Item,
    F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
{
    map_with(move |item: I, _: &WorkerBag| f(item), stage)
}

/// Like [`map`], with access to the worker's bag.
pub fn map_with<I, O, F>(f: F, stage: impl Into<Stage<I>>) -> StageBuilder<I, O>
where
    I: Item,
    O: Item,
    F: Fn(I, &WorkerBag) -> anyhow::Result<O> + Send + Sync + 'static,
{
    StageBuilder::new(Behavior::Transform(Arc::new(f)), vec![stage.into()])
}

/// Applies `f` to every item and emits each element of the result.
pub fn flat_map<I, O, F, It>(f: F, stage: impl Into<Stage<I>>) -> StageBuilder<I, O>
where
    I: Item,
    O: Item,
    F: Fn(I) -> anyhow::Result<It> + Send + Sync + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    flat_map_with(move |item: I, _: &WorkerBag| f(item), stage)
}

/// Like [`flat_map`], with access to the worker's bag.
pub fn flat_map_with<I, O, F, It>(f: F, stage: impl Into<Stage<I>>) -> StageBuilder<I, O>
where
    I: Item,
    O: Item,
    F: Fn(I, &WorkerBag) -> anyhow::Result<It> + Send + Sync + 'static,
    It: IntoIterator<Item = O>,
    It::IntoIter: Send + 'static,
{
    let expand = move |item: I, bag: &WorkerBag| -> anyhow::Result<Box<dyn Iterator<Item = O> + Send>> {
        Ok(Box::new(f(item, bag)?.into_iter()))
    };
    StageBuilder::new(Behavior::Expand(Arc::new(expand)), vec![stage.into()])
}

/// Emits only the items for which `f` returns true.
pub fn filter<T, F>(f: F, stage: impl Into<Stage<T>>) -> StageBuilder<T, T>
where
    T: Item,
    F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    filter_with(move |item: &T, _: &WorkerBag| f(item), stage)
}

/// Like [`filter`], with access to the worker's bag.
pub fn filter_with<T, F>(f: F, stage: impl Into<Stage<T>>) -> StageBuilder<T, T>
where
    T: Item,
    F: Fn(&T, &WorkerBag) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    let select = move |item: T, bag: &WorkerBag| -> anyhow::Result<Option<T>> {
        Ok(f(&item, bag)?.then_some(item))
    };
    StageBuilder::new(Behavior::Select(Arc::new(select)), vec![stage.into()])
}

/// Calls `f` on every item for its side effects; emits nothing.
pub fn each<T, F>(f: F, stage: impl Into<Stage<T>>) -> StageBuilder<T, ()>
where
    T: Item,
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    each_with(move |item: T, _: &WorkerBag| f(item), stage)
}

/// Like [`each`], with access to the worker's bag.
pub fn each_with<T, F>(f: F, stage: impl Into<Stage<T>>) -> StageBuilder<T, ()>
where
    T: Item,
    F: Fn(T, &WorkerBag) -> anyhow::Result<()> + Send + Sync + 'static,
{
    StageBuilder::new(Behavior::Effect(Arc::new(f)), vec![stage.into()])
}

/// Merges several stages into one pass-through stage with a single worker.
///
/// Items from different inputs interleave in arrival order. A stage listed
/// more than once is consumed once.
pub fn concat<T: Item>(stages: impl IntoIterator<Item = Stage<T>>) -> StageBuilder<T, T> {
    let mut seen = HashSet::new();
    let dependencies = stages
        .into_iter()
        .filter(|stage| seen.insert(stage.id()))
        .collect();
    StageBuilder::new(Behavior::PassThrough(std::convert::identity), dependencies)
}

/// Method forms of the stage functions, for left-to-right pipelines.
///
/// ```rust,ignore
/// let evens = from_iterable(0..10)
///     .map(|x: i32| Ok(x + 1))
///     .with_workers(3)
///     .build()?
///     .filter(|x: &i32| Ok(x % 2 == 0))
///     .to_vec()?;
/// ```
impl<T: Item> Stage<T> {
    /// Same as [`map`] with this stage as input.
    pub fn map<O, F>(&self, f: F) -> StageBuilder<T, O>
    where
        O: Item,
        F: Fn(T) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        map(f, self)
    }

    /// Same as [`flat_map`] with this stage as input.
    pub fn flat_map<O, F, It>(&self, f: F) -> StageBuilder<T, O>
    where
        O: Item,
        F: Fn(T) -> anyhow::Result<It> + Send + Sync + 'static,
        It: IntoIterator<Item = O>,
        It::IntoIter: Send + 'static,
    {
        flat_map(f, self)
    }

    /// Same as [`filter`] with this stage as input.
    pub fn filter<F>(&self, f: F) -> StageBuilder<T, T>
    where
        F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        filter(f, self)
    }

    /// Same as [`each`] with this stage as input.
    pub fn each<F>(&self, f: F) -> StageBuilder<T, ()>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        each(f, self)
    }
}

impl<T: Item> SourceBuilder<T> {
    /// Builds the source and maps over it.
    pub fn map<O, F>(self, f: F) -> StageBuilder<T, O>
    where
        O: Item,
        F: Fn(T) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        map(f, self.build())
    }

    /// Builds the source and flat-maps over it.
    pub fn flat_map<O, F, It>(self, f: F) -> StageBuilder<T, O>
    where
        O: Item,
        F: Fn(T) -> anyhow::Result<It> + Send + Sync + 'static,
        It: IntoIterator<Item = O>,
        It::IntoIter: Send + 'static,
    {
        flat_map(f, self.build())
    }

    /// Builds the source and filters it.
    pub fn filter<F>(self, f: F) -> StageBuilder<T, T>
    where
        F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        filter(f, self.build())
    }

    /// Builds the source and calls `f` on each of its items.
    pub fn each<F>(self, f: F) -> StageBuilder<T, ()>
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        each(f, self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sorted;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zero_workers_rejected() {
        let err = map(|x: i32| Ok(x), vec![1]).with_name("noop").with_workers(0).build().unwrap_err();
        assert_eq!(err.code(), Some(ZERO_WORKERS));
        assert_eq!(err.stages, vec!["noop".to_string()]);
    }

    #[test]
    fn test_empty_concat_rejected() {
        let err = concat(Vec::<Stage<i32>>::new()).build().unwrap_err();
        assert_eq!(err.code(), Some(EMPTY_RUN));
    }

    #[test]
    fn test_concat_dedups_inputs() {
        let source: Stage<i32> = vec![1, 2].into();
        let merged = concat([source.clone(), source.clone()]).build().unwrap();
        assert_eq!(merged.dependencies().len(), 1);
        assert_eq!(merged.workers(), 1);
        assert_eq!(merged.kind(), StageKind::PassThrough);
        assert_eq!(sorted(merged.to_vec().unwrap()), vec![1, 2]);
    }

    #[test]
    fn test_default_names_follow_kind() {
        let stage = filter(|x: &i32| Ok(*x > 0), vec![1]).build().unwrap();
        assert_eq!(stage.name(), format!("filter-{}", stage.id().get()));
        assert_eq!(stage.config().capacity, 0);
        assert_eq!(stage.config().substrate, Substrate::Thread);
    }

    #[test]
    fn test_builder_shortcuts() {
        let out = map(|x: i32| Ok(x * 10), vec![1, 2, 3]).to_vec().unwrap();
        assert_eq!(out, vec![10, 20, 30]);

        each(|_: i32| Ok(()), vec![1]).run().unwrap();
    }

    #[test]
    fn test_with_variants_see_bag() {
        let out = map_with(
            |x: i64, bag: &WorkerBag| Ok(x + bag.get::<i64>("offset").copied().unwrap_or(0)),
            vec![1_i64, 2],
        )
        .with_on_start(|_| Ok(WorkerBag::new().with("offset", 100_i64)))
        .to_vec()
        .unwrap();
        assert_eq!(out, vec![101, 102]);

        let out = filter_with(
            |x: &i64, bag: &WorkerBag| Ok(*x >= *bag.get::<i64>("min").unwrap_or(&0)),
            vec![1_i64, 5, 9],
        )
        .with_on_start(|_| Ok(WorkerBag::new().with("min", 5_i64)))
        .to_vec()
        .unwrap();
        assert_eq!(out, vec![5, 9]);

        let out = flat_map_with(
            |x: u8, bag: &WorkerBag| Ok(vec![x; *bag.get::<usize>("copies").unwrap_or(&1)]),
            vec![7_u8],
        )
        .with_on_start(|_| Ok(WorkerBag::new().with("copies", 3_usize)))
        .to_vec()
        .unwrap();
        assert_eq!(out, vec![7, 7, 7]);
    }

    #[test]
    fn test_method_chaining_builds_the_same_pipeline() {
        let chained = from_iterable(0..10)
            .map(|x: i32| Ok(x + 1))
            .with_workers(3)
            .build()
            .unwrap()
            .filter(|x: &i32| Ok(x % 2 == 0))
            .build()
            .unwrap()
            .flat_map(|x: i32| Ok(vec![x, x * 100]))
            .to_vec()
            .unwrap();
        assert_eq!(sorted(chained), vec![2, 4, 6, 8, 10, 200, 400, 600, 800, 1000]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        from_iterable(vec!["a", "b"])
            .filter(|s: &&str| Ok(*s != "b"))
            .build()
            .unwrap()
            .each(move |s: &str| {
                sink.lock().push(s.to_string());
                Ok(())
            })
            .run()
            .unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_chained_stage_keeps_its_input() {
        let source = from_iterable(vec![1, 2]).with_name("numbers").build();
        let doubled = source.map(|x: i32| Ok(x * 2)).build().unwrap();
        assert_eq!(doubled.dependencies()[0].name, "numbers");
        assert_eq!(doubled.to_vec().unwrap(), vec![2, 4]);
    }
}
