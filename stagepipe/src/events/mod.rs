//! Lifecycle events emitted while a pipeline runs.
//!
//! A sink is configured per run through
//! [`RunConfig::with_events`](crate::config::RunConfig::with_events). Worker
//! loops and the drain await [`EventSink::emit`]; synchronous paths such as
//! spawning, failure recording and dropping a drain use the non-blocking
//! [`EventSink::try_emit`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names used by the engine.
pub mod names {
    /// A drain started its workers.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A drain reached exhaustion without failure.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A drain raised a recorded failure.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A drain was dropped before exhaustion.
    pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
    /// A worker finished `on_start` and entered its loop.
    pub const WORKER_STARTED: &str = "worker.started";
    /// A worker exited and sent its Done tokens.
    pub const WORKER_COMPLETED: &str = "worker.completed";
    /// A stage recorded a failure.
    pub const STAGE_FAILED: &str = "stage.failed";
}
