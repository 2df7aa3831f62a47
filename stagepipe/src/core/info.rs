//! Values handed to worker lifecycle hooks.

use super::status::Substrate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the worker an `on_start` hook is running for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Stage name.
    pub stage: String,
    /// Zero-based worker index within the stage.
    pub index: usize,
    /// Total workers in the stage.
    pub workers: usize,
    /// Substrate the worker runs on.
    pub substrate: Substrate,
    /// Run the worker belongs to.
    pub run_id: Uuid,
}

/// Progress of a stage, handed to `on_done` when a worker exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    /// Stage name.
    pub stage: String,
    /// Index of the exiting worker.
    pub worker: usize,
    /// Items this worker pulled and processed.
    pub items_processed: usize,
    /// Workers of the stage still running, not counting this one.
    pub active_workers: usize,
    /// Whether the run has recorded a failure.
    pub failed: bool,
    /// Time this worker spent running, in milliseconds.
    pub elapsed_ms: f64,
}

impl StageStatus {
    /// Returns true when this worker is the last of its stage to exit.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.active_workers == 0
    }
}
