//! Error types for stagepipe.
//!
//! Structural mistakes (building a graph that can never run) surface as
//! [`PipelineValidationError`] before any worker starts. Failures raised by
//! user callables while a run is in flight are captured as a [`StageFailure`]
//! and re-raised by the drain as [`PipelineError::StageFailed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Code for a stage configured with zero workers.
pub const ZERO_WORKERS: &str = "CONTRACT-ZERO-WORKERS";
/// Code for running or concatenating an empty list of stages.
pub const EMPTY_RUN: &str = "CONTRACT-EMPTY-RUN";
/// Code for attaching a single-use source to a second run.
pub const SOURCE_CONSUMED: &str = "CONTRACT-SRC-CONSUMED";
/// Code for an invalid [`RunConfig`](crate::config::RunConfig).
pub const INVALID_CONFIG: &str = "CONTRACT-CONFIG";
/// Code for task workers requested on a caller runtime that does not exist.
pub const NO_RUNTIME: &str = "CONTRACT-NO-RUNTIME";

/// The main error type for stagepipe operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The graph could not be built or started.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A worker, hook or source failed while the pipeline was running.
    #[error("{0}")]
    StageFailed(#[from] StageFailure),

    /// The task runtime could not be created.
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Returns the failure descriptor if this error came from a running stage.
    #[must_use]
    pub fn failure(&self) -> Option<&FailureDescriptor> {
        match self {
            Self::StageFailed(failure) => Some(&failure.descriptor),
            _ => None,
        }
    }

    /// Returns the contract code if this is a validation error.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Validation(err) => err.error_info.as_ref().map(|info| info.code.as_str()),
            _ => None,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-ZERO-WORKERS").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// URL to documentation.
    pub doc_url: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            doc_url: None,
            context: HashMap::new(),
        }
    }

    /// Creates contract info pre-filled from the registered suggestion for `code`.
    #[must_use]
    pub fn suggested(code: &str) -> Self {
        match ContractSuggestion::get(code) {
            Some(suggestion) => Self::new(code, suggestion.summary)
                .with_fix_hint(suggestion.fix_steps.join("; ")),
            None => Self::new(code, code),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Sets the documentation URL.
    #[must_use]
    pub fn with_doc_url(mut self, url: impl Into<String>) -> Self {
        self.doc_url = Some(url.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a JSON value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Error raised when a pipeline graph is structurally invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Creates an error carrying the suggested contract info for `code`.
    #[must_use]
    pub fn contract(code: &str, message: impl Into<String>) -> Self {
        Self::new(message).with_error_info(ContractErrorInfo::suggested(code))
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Remediation info for a contract violation.
#[derive(Debug, Clone)]
pub struct ContractSuggestion {
    /// Short title for the error.
    pub title: &'static str,
    /// Detailed summary of the issue.
    pub summary: &'static str,
    /// Steps to fix the issue.
    pub fix_steps: &'static [&'static str],
}

impl ContractSuggestion {
    /// Looks up the suggestion registered for an error code.
    #[must_use]
    pub fn get(code: &str) -> Option<Self> {
        let suggestion = match code {
            ZERO_WORKERS => Self {
                title: "Stage Without Workers",
                summary: "A stage must run at least one worker.",
                fix_steps: &["Pass a positive value to with_workers"],
            },
            EMPTY_RUN => Self {
                title: "Nothing To Run",
                summary: "Cannot run or concatenate an empty list of stages.",
                fix_steps: &[
                    "Pass at least one stage",
                    "Skip the run when the list is empty",
                ],
            },
            SOURCE_CONSUMED => Self {
                title: "Source Already Consumed",
                summary: "A single-use source was attached to more than one run.",
                fix_steps: &[
                    "Use from_iterable with a cloneable collection to replay the source",
                    "Rebuild the source before running the pipeline again",
                ],
            },
            INVALID_CONFIG => Self {
                title: "Invalid Run Configuration",
                summary: "The run configuration contains an out-of-range value.",
                fix_steps: &["Set task_threads to at least 1"],
            },
            NO_RUNTIME => Self {
                title: "No Tokio Runtime",
                summary: "Task workers were asked to run on the current runtime outside of one.",
                fix_steps: &[
                    "Start the drain from inside a tokio runtime",
                    "Or use TaskRuntime::Dedicated",
                ],
            },
            _ => return None,
        };
        Some(suggestion)
    }
}

/// What part of a worker's lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The per-item worker function failed.
    WorkerFn,
    /// The `on_start` hook failed.
    OnStart,
    /// The `on_done` hook failed.
    OnDone,
    /// A source iterator panicked while producing.
    Source,
    /// A worker could not be spawned.
    Spawn,
    /// An upstream edge closed before delivering all of its Done tokens.
    Disconnected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerFn => write!(f, "worker_fn"),
            Self::OnStart => write!(f, "on_start"),
            Self::OnDone => write!(f, "on_done"),
            Self::Source => write!(f, "source"),
            Self::Spawn => write!(f, "spawn"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A transportable description of a failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    /// Name of the stage where the failure happened.
    pub stage: String,
    /// Index of the failing worker, if a worker was running.
    pub worker: Option<usize>,
    /// Lifecycle phase that failed.
    pub kind: FailureKind,
    /// Rendered error chain.
    pub message: String,
    /// Whether the failure was a panic rather than a returned error.
    pub panicked: bool,
    /// Captured backtrace text, when backtraces are enabled.
    pub trace: Option<String>,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}'", self.stage)?;
        if let Some(worker) = self.worker {
            write!(f, " worker {worker}")?;
        }
        if self.panicked {
            write!(f, " panicked in {}: {}", self.kind, self.message)
        } else {
            write!(f, " failed in {}: {}", self.kind, self.message)
        }
    }
}

/// A failure raised inside a running pipeline.
///
/// Keeps the original error as its source so callers can downcast to their
/// own error types after the drain re-raises it.
#[derive(Debug, Error)]
#[error("{descriptor}")]
pub struct StageFailure {
    /// Transportable description of the failure.
    pub descriptor: FailureDescriptor,
    /// The original error.
    #[source]
    pub source: anyhow::Error,
}

impl StageFailure {
    /// Creates a failure from an error raised by a stage.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        worker: Option<usize>,
        kind: FailureKind,
        source: anyhow::Error,
    ) -> Self {
        let trace = match source.backtrace().status() {
            std::backtrace::BacktraceStatus::Captured => Some(source.backtrace().to_string()),
            _ => None,
        };
        Self {
            descriptor: FailureDescriptor {
                stage: stage.into(),
                worker,
                kind,
                message: format!("{source:#}"),
                panicked: false,
                trace,
                occurred_at: Utc::now(),
            },
            source,
        }
    }

    /// Marks the failure as caused by a panic.
    #[must_use]
    pub fn panicked(mut self, panicked: bool) -> Self {
        self.descriptor.panicked = panicked;
        self
    }

    /// Returns the failure kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.descriptor.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_code() {
        let err = PipelineValidationError::contract(ZERO_WORKERS, "stage 'map-1' has no workers")
            .with_stages(vec!["map-1".to_string()]);

        assert_eq!(err.code(), Some(ZERO_WORKERS));
        assert_eq!(err.stages, vec!["map-1".to_string()]);
        assert_eq!(err.to_string(), "stage 'map-1' has no workers");

        let info = err.error_info.unwrap();
        assert!(info.fix_hint.unwrap().contains("with_workers"));
    }

    #[test]
    fn test_unknown_code_has_no_suggestion() {
        assert!(ContractSuggestion::get("CONTRACT-NOPE").is_none());
        let info = ContractErrorInfo::suggested("CONTRACT-NOPE");
        assert_eq!(info.summary, "CONTRACT-NOPE");
        assert!(info.fix_hint.is_none());
    }

    #[test]
    fn test_contract_info_to_json() {
        let info = ContractErrorInfo::new(EMPTY_RUN, "empty")
            .with_doc_url("https://example.com")
            .with_context_entry("stages", "0");

        let json = info.to_json();
        assert_eq!(json["code"], EMPTY_RUN);
        assert_eq!(json["context"]["stages"], "0");
    }

    #[test]
    fn test_stage_failure_keeps_source() {
        #[derive(Debug, Error)]
        #[error("bad item {0}")]
        struct BadItem(i32);

        let failure = StageFailure::new("map-3", Some(1), FailureKind::WorkerFn, BadItem(5).into());
        assert_eq!(failure.descriptor.message, "bad item 5");
        assert_eq!(failure.kind(), FailureKind::WorkerFn);
        assert!(!failure.descriptor.panicked);
        assert_eq!(failure.to_string(), "stage 'map-3' worker 1 failed in worker_fn: bad item 5");

        let err = PipelineError::from(failure);
        assert_eq!(err.failure().map(|d| d.worker), Some(Some(1)));
        let PipelineError::StageFailed(failure) = err else {
            panic!("expected a stage failure");
        };
        assert!(failure.source.downcast_ref::<BadItem>().is_some());
    }

    #[test]
    fn test_failure_message_renders_context_chain() {
        let source = anyhow::anyhow!("connection reset").context("fetching row 7");
        let failure = StageFailure::new("each-2", None, FailureKind::OnDone, source).panicked(true);
        assert_eq!(failure.descriptor.message, "fetching row 7: connection reset");
        assert_eq!(
            failure.to_string(),
            "stage 'each-2' panicked in on_done: fetching row 7: connection reset"
        );
    }

    #[test]
    fn test_descriptor_serializes() {
        let failure = StageFailure::new("src", Some(0), FailureKind::Source, anyhow::anyhow!("boom"));
        let json = serde_json::to_value(&failure.descriptor).unwrap();
        assert_eq!(json["kind"], "source");
        let back: FailureDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, failure.descriptor);
    }
}
