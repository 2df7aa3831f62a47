//! Hooks that record worker lifecycle calls.

use crate::core::{StageStatus, WorkerBag, WorkerInfo};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Recorded {
    started: Vec<WorkerInfo>,
    finished: Vec<StageStatus>,
    fail_start: Option<String>,
}

/// Records every `on_start` and `on_done` call made by a stage's workers.
///
/// ```rust,ignore
/// let hooks = RecordingHooks::new();
/// let stage = map(|x: i32| Ok(x), source)
///     .with_workers(3)
///     .with_on_start(hooks.on_start())
///     .with_on_done(hooks.on_done())
///     .build()?;
/// stage.run()?;
/// assert_eq!(hooks.start_count(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingHooks {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingHooks {
    /// Creates hooks that succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates hooks whose `on_start` fails with `message`.
    #[must_use]
    pub fn failing_start(message: impl Into<String>) -> Self {
        let hooks = Self::default();
        hooks.inner.lock().fail_start = Some(message.into());
        hooks
    }

    /// Returns an `on_start` hook that records the worker and hands it a bag
    /// holding its index under `"worker"`.
    pub fn on_start(&self) -> impl Fn(&WorkerInfo) -> anyhow::Result<WorkerBag> + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move |info: &WorkerInfo| {
            let mut recorded = inner.lock();
            recorded.started.push(info.clone());
            if let Some(message) = &recorded.fail_start {
                anyhow::bail!("{message}");
            }
            Ok(WorkerBag::new().with("worker", info.index))
        }
    }

    /// Returns an `on_done` hook that records the final status.
    pub fn on_done(&self) -> impl Fn(&StageStatus, &WorkerBag) -> anyhow::Result<()> + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move |status: &StageStatus, _: &WorkerBag| {
            inner.lock().finished.push(status.clone());
            Ok(())
        }
    }

    /// Returns the number of `on_start` calls.
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.inner.lock().started.len()
    }

    /// Returns the number of `on_done` calls.
    #[must_use]
    pub fn done_count(&self) -> usize {
        self.inner.lock().finished.len()
    }

    /// Returns the worker infos passed to `on_start`.
    #[must_use]
    pub fn started(&self) -> Vec<WorkerInfo> {
        self.inner.lock().started.clone()
    }

    /// Returns the statuses passed to `on_done`.
    #[must_use]
    pub fn finished(&self) -> Vec<StageStatus> {
        self.inner.lock().finished.clone()
    }

    /// Returns the total items processed across all finished workers.
    #[must_use]
    pub fn items_processed(&self) -> usize {
        self.inner.lock().finished.iter().map(|s| s.items_processed).sum()
    }
}
