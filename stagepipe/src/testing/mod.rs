//! Testing utilities for stagepipe pipelines.
//!
//! This module provides:
//! - Recording hooks that count worker starts and finishes
//! - Order-insensitive assertions for multi-worker output

mod assertions;
mod hooks;

pub use assertions::{assert_same_multiset, sorted};
pub use hooks::RecordingHooks;
