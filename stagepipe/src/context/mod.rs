//! Per-run shared state handed to every worker.

mod run;
mod state;

pub use run::RunContext;
pub use state::PipelineState;
