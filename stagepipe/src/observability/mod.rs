//! Logging setup, timing and run statistics.

mod stats;
mod tracing;

pub use self::tracing::{init_tracing, SpanTimer};
pub use stats::{RunStats, StageCounters, StageSnapshot};
