//! Stage construction and execution.
//!
//! This module provides:
//! - Builders that derive stages from callables and existing stages
//! - The per-edge queue network with Done-token termination
//! - Workers on OS threads or tokio tasks
//! - The drain that starts a run and yields its output

mod behavior;
mod builder;
mod drain;
mod network;
mod stage;
mod worker;


pub use behavior::{OnDone, OnStart};
pub use builder::{
    concat, each, each_with, filter, filter_with, flat_map, flat_map_with, from_iter_once,
    from_iterable, map, map_with, SourceBuilder, StageBuilder,
};
pub use drain::{run, run_all, run_all_with, run_with, to_iterable, to_iterable_with, Drain};
pub use stage::{Item, Stage, StageConfig, StageId};
