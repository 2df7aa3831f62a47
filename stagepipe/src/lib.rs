//! # Stagepipe
//!
//! Concurrent data pipelines built from immutable stages.
//!
//! Stagepipe provides:
//!
//! - **Stage composition**: map, flat_map, filter, each and concat derive new
//!   stages from callables and existing stages without mutating them
//! - **Bounded queues**: one queue per producer/consumer edge, with
//!   backpressure when a consumer falls behind
//! - **Worker substrates**: OS threads or tokio tasks, per stage
//! - **Deterministic termination**: one Done token per upstream worker
//! - **Fail-fast errors**: the first failure stops the run and is raised by
//!   the drain with its stage, worker and cause
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagepipe::prelude::*;
//!
//! let source = from_iterable(1..=100_u64).build();
//! let squares = map(|x: u64| Ok(x * x), &source).with_workers(4).with_capacity(8).build()?;
//! let odd = filter(|x: &u64| Ok(x % 2 == 1), &squares).build()?;
//!
//! for item in odd.to_iterable()? {
//!     println!("{}", item?);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LogConfig, LogFormat, RunConfig, TaskRuntime};
    pub use crate::core::{StageKind, StageStatus, Substrate, WorkerBag, WorkerInfo};
    pub use crate::errors::{
        ContractErrorInfo, FailureDescriptor, FailureKind, PipelineError,
        PipelineValidationError, StageFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, RunStats, StageSnapshot};
    pub use crate::pipeline::{
        concat, each, each_with, filter, filter_with, flat_map, flat_map_with, from_iter_once,
        from_iterable, map, map_with, run, run_all, run_all_with, run_with, to_iterable,
        to_iterable_with, Drain, Stage, StageBuilder, StageId,
    };
}
