//! The failure flag and failure slot shared by every worker of a run.

use crate::errors::{FailureDescriptor, StageFailure};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Shared state for one run.
///
/// `failed` goes from false to true at most once and the first recorded
/// failure wins. Cancellation stops workers the same way but is not a failure.
/// Both flags are mirrored into a watch channel so a worker blocked on a queue
/// wakes as soon as the run stops.
#[derive(Debug)]
pub struct PipelineState {
    failed: AtomicBool,
    cancelled: AtomicBool,
    failure: Mutex<Option<StageFailure>>,
    descriptor: Mutex<Option<FailureDescriptor>>,
    stop: watch::Sender<bool>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    /// Creates fresh state for a new run.
    #[must_use]
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            failed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            descriptor: Mutex::new(None),
            stop,
        }
    }

    /// Returns true once a failure has been recorded.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns true once the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true if workers should stop pulling input.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.is_failed() || self.is_cancelled()
    }

    /// Records a failure. Returns false if another failure was recorded first.
    pub fn record_failure(&self, failure: StageFailure) -> bool {
        {
            let mut slot = self.failure.lock();
            if self.failed.load(Ordering::SeqCst) {
                return false;
            }
            *self.descriptor.lock() = Some(failure.descriptor.clone());
            *slot = Some(failure);
            self.failed.store(true, Ordering::SeqCst);
        }
        self.stop.send_replace(true);
        true
    }

    /// Stops the run without recording a failure.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop.send_replace(true);
        }
    }

    /// Returns the descriptor of the recorded failure.
    ///
    /// Remains available after [`take_failure`](Self::take_failure).
    #[must_use]
    pub fn failure(&self) -> Option<FailureDescriptor> {
        self.descriptor.lock().clone()
    }

    /// Takes the recorded failure so it can be raised exactly once.
    pub fn take_failure(&self) -> Option<StageFailure> {
        self.failure.lock().take()
    }

    /// Resolves once the run has failed or been cancelled.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn failure(stage: &str) -> StageFailure {
        StageFailure::new(stage, Some(0), FailureKind::WorkerFn, anyhow::anyhow!("{stage} broke"))
    }

    #[test]
    fn test_state_starts_clear() {
        let state = PipelineState::new();
        assert!(!state.is_failed());
        assert!(!state.should_stop());
        assert!(state.failure().is_none());
    }

    #[test]
    fn test_first_failure_wins() {
        let state = PipelineState::new();
        assert!(state.record_failure(failure("first")));
        assert!(!state.record_failure(failure("second")));

        assert!(state.is_failed());
        assert_eq!(state.failure().unwrap().stage, "first");
        assert_eq!(state.take_failure().unwrap().descriptor.stage, "first");
        assert!(state.take_failure().is_none());
        // The descriptor outlives the take.
        assert_eq!(state.failure().unwrap().stage, "first");
    }

    #[test]
    fn test_cancel_is_not_a_failure() {
        let state = PipelineState::new();
        state.cancel();
        state.cancel();
        assert!(state.is_cancelled());
        assert!(state.should_stop());
        assert!(!state.is_failed());
        assert!(state.take_failure().is_none());
    }

    #[test]
    fn test_stopped_resolves_after_the_fact() {
        let state = PipelineState::new();
        state.cancel();
        futures::executor::block_on(state.stopped());
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let state = Arc::new(PipelineState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.stopped().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.record_failure(failure("map"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_concurrent_failures_record_one() {
        let state = Arc::new(PipelineState::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || state.record_failure(failure(&format!("s{i}"))))
            })
            .collect();

        let wins = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
