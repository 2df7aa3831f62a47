//! Per-item stage behaviors and worker lifecycle hooks.

use super::network::{Delivery, Fanout};
use super::stage::Item;
use crate::context::PipelineState;
use crate::core::{StageKind, StageStatus, WorkerBag, WorkerInfo};
use crate::errors::{FailureKind, StageFailure};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) type TransformFn<I, O> = Arc<dyn Fn(I, &WorkerBag) -> anyhow::Result<O> + Send + Sync>;
pub(crate) type ExpandFn<I, O> =
    Arc<dyn Fn(I, &WorkerBag) -> anyhow::Result<Box<dyn Iterator<Item = O> + Send>> + Send + Sync>;
pub(crate) type SelectFn<I, O> = Arc<dyn Fn(I, &WorkerBag) -> anyhow::Result<Option<O>> + Send + Sync>;
pub(crate) type EffectFn<I> = Arc<dyn Fn(I, &WorkerBag) -> anyhow::Result<()> + Send + Sync>;

/// Hook run once per worker before its loop; its bag is passed to every call.
pub type OnStart = Arc<dyn Fn(&WorkerInfo) -> anyhow::Result<WorkerBag> + Send + Sync>;

/// Hook run once per worker after its loop.
pub type OnDone = Arc<dyn Fn(&StageStatus, &WorkerBag) -> anyhow::Result<()> + Send + Sync>;

/// What a stage does with each item it pulls.
///
/// Select and pass-through stages emit their input, so their output type is
/// the input type; the builders guarantee `O == I` for those variants.
pub(crate) enum Behavior<I, O> {
    Transform(TransformFn<I, O>),
    Expand(ExpandFn<I, O>),
    Select(SelectFn<I, O>),
    Effect(EffectFn<I>),
    PassThrough(fn(I) -> O),
}

impl<I: Item, O: Item> Behavior<I, O> {
    pub(crate) const fn kind(&self) -> StageKind {
        match self {
            Self::Transform(_) => StageKind::Transform,
            Self::Expand(_) => StageKind::Expand,
            Self::Select(_) => StageKind::Select,
            Self::Effect(_) => StageKind::Effect,
            Self::PassThrough(_) => StageKind::PassThrough,
        }
    }

    /// Applies the behavior to one item and pushes the results downstream.
    ///
    /// Stops emitting as soon as a put does not deliver.
    pub(crate) async fn apply(
        &self,
        item: I,
        bag: &WorkerBag,
        out: &Fanout<O>,
        state: &PipelineState,
    ) -> Result<Delivery, Fault> {
        match self {
            Self::Transform(f) => {
                let value = guarded(|| f(item, bag))?;
                Ok(out.put(value, state).await)
            }
            Self::Expand(f) => {
                let mut values = guarded(|| f(item, bag))?;
                while let Some(value) = guarded(|| Ok(values.next()))? {
                    let delivery = out.put(value, state).await;
                    if delivery != Delivery::Delivered {
                        return Ok(delivery);
                    }
                }
                Ok(Delivery::Delivered)
            }
            Self::Select(f) => match guarded(|| f(item, bag))? {
                Some(value) => Ok(out.put(value, state).await),
                None => Ok(Delivery::Delivered),
            },
            Self::Effect(f) => {
                guarded(|| f(item, bag))?;
                Ok(Delivery::Delivered)
            }
            Self::PassThrough(f) => Ok(out.put(f(item), state).await),
        }
    }
}

/// Optional lifecycle hooks of a stage.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_start: Option<OnStart>,
    pub(crate) on_done: Option<OnDone>,
}

impl Hooks {
    pub(crate) fn start(&self, info: &WorkerInfo) -> Result<WorkerBag, Fault> {
        match &self.on_start {
            Some(on_start) => guarded(|| on_start(info)),
            None => Ok(WorkerBag::new()),
        }
    }

    pub(crate) fn done(&self, status: &StageStatus, bag: &WorkerBag) -> Result<(), Fault> {
        match &self.on_done {
            Some(on_done) => guarded(|| on_done(status, bag)),
            None => Ok(()),
        }
    }
}

/// An error or panic raised by user code.
#[derive(Debug)]
pub(crate) struct Fault {
    error: anyhow::Error,
    panicked: bool,
}

impl Fault {
    pub(crate) fn into_failure(self, stage: &str, worker: Option<usize>, kind: FailureKind) -> StageFailure {
        StageFailure::new(stage, worker, kind, self.error).panicked(self.panicked)
    }
}

/// Runs user code, turning both returned errors and panics into a [`Fault`].
pub(crate) fn guarded<R>(f: impl FnOnce() -> anyhow::Result<R>) -> Result<R, Fault> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Fault {
            error,
            panicked: false,
        }),
        Err(payload) => Err(Fault {
            error: anyhow::anyhow!("panic: {}", panic_message(payload.as_ref())),
            panicked: true,
        }),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_passes_values_and_errors() {
        assert_eq!(guarded(|| Ok(3)).unwrap(), 3);

        let fault = guarded::<()>(|| Err(anyhow::anyhow!("nope"))).unwrap_err();
        assert!(!fault.panicked);
        let failure = fault.into_failure("map-1", Some(0), FailureKind::WorkerFn);
        assert_eq!(failure.descriptor.message, "nope");
    }

    #[test]
    fn test_guarded_catches_panics() {
        let fault = guarded::<()>(|| panic!("bad {}", 7)).unwrap_err();
        assert!(fault.panicked);
        let failure = fault.into_failure("map-1", None, FailureKind::WorkerFn);
        assert!(failure.descriptor.panicked);
        assert_eq!(failure.descriptor.message, "panic: bad 7");
    }

    #[test]
    fn test_hooks_default_to_empty_bag() {
        let hooks = Hooks::default();
        let info = WorkerInfo {
            stage: "map-1".to_string(),
            index: 0,
            workers: 1,
            substrate: crate::core::Substrate::Thread,
            run_id: uuid::Uuid::nil(),
        };
        assert!(hooks.start(&info).unwrap().is_empty());
    }
}
