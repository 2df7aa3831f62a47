//! Stage kind and worker substrate enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The per-item behavior a stage applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Produces items from an iterable; has no upstream stages.
    Source,
    /// Emits exactly one output per input.
    Transform,
    /// Emits zero or more outputs per input.
    Expand,
    /// Emits the input only when a predicate holds.
    Select,
    /// Runs a side effect and emits nothing.
    Effect,
    /// Forwards inputs unchanged; used to merge several stages.
    PassThrough,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Transform => write!(f, "map"),
            Self::Expand => write!(f, "flat_map"),
            Self::Select => write!(f, "filter"),
            Self::Effect => write!(f, "each"),
            Self::PassThrough => write!(f, "concat"),
        }
    }
}

/// Where a stage's workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substrate {
    /// One OS thread per worker.
    #[default]
    Thread,
    /// One tokio task per worker.
    Task,
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Task => write!(f, "task"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Transform.to_string(), "map");
        assert_eq!(StageKind::PassThrough.to_string(), "concat");
    }

    #[test]
    fn test_substrate_default_is_thread() {
        assert_eq!(Substrate::default(), Substrate::Thread);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&StageKind::PassThrough).unwrap();
        assert_eq!(json, "\"pass_through\"");

        let substrate: Substrate = serde_json::from_str("\"task\"").unwrap();
        assert_eq!(substrate, Substrate::Task);
    }
}
