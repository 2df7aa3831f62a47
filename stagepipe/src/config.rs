//! Run and logging configuration.

use crate::errors::{PipelineValidationError, INVALID_CONFIG};
use crate::events::{EventSink, NoOpEventSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which tokio runtime hosts task-substrate workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRuntime {
    /// A multi-thread runtime created for the run and owned by its drain.
    #[default]
    Dedicated,
    /// The runtime the drain is created on.
    ///
    /// Consume such a drain with `recv().await` or as a stream; the blocking
    /// iterator would starve a current-thread runtime.
    Current,
}

/// Options for one pipeline run.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Output capacity of the merge stage created by `run_all`; 0 is unbounded.
    pub capacity: usize,
    /// Worker threads of a dedicated task runtime.
    pub task_threads: usize,
    /// Runtime used for task-substrate workers.
    pub runtime: TaskRuntime,
    /// How long dropping a drain waits for cancelled tasks to wind down.
    pub shutdown_grace_ms: u64,
    /// Receives lifecycle events.
    #[serde(skip, default = "default_events")]
    pub events: Arc<dyn EventSink>,
}

fn default_events() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            task_threads: 1,
            runtime: TaskRuntime::Dedicated,
            shutdown_grace_ms: 1_000,
            events: default_events(),
        }
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("capacity", &self.capacity)
            .field("task_threads", &self.task_threads)
            .field("runtime", &self.runtime)
            .field("shutdown_grace_ms", &self.shutdown_grace_ms)
            .finish_non_exhaustive()
    }
}

impl RunConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity of the merge stage created by `run_all`.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the number of dedicated runtime threads.
    #[must_use]
    pub fn with_task_threads(mut self, threads: usize) -> Self {
        self.task_threads = threads;
        self
    }

    /// Selects the runtime for task workers.
    #[must_use]
    pub fn with_runtime(mut self, runtime: TaskRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Checks the configuration for out-of-range values.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.task_threads == 0 {
            return Err(PipelineValidationError::contract(
                INVALID_CONFIG,
                "task_threads must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Options for [`init_tracing`](crate::observability::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: String,
    /// Output format.
    pub format: LogFormat,
    /// Whether to print event targets.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "stagepipe=info".to_string(),
            format: LogFormat::Compact,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Sets the filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.capacity, 0);
        assert_eq!(config.task_threads, 1);
        assert_eq!(config.runtime, TaskRuntime::Dedicated);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_config_rejects_zero_threads() {
        let err = RunConfig::new().with_task_threads(0).validate().unwrap_err();
        assert_eq!(err.code(), Some(INVALID_CONFIG));
    }

    #[test]
    fn test_run_config_from_partial_json() {
        let config: RunConfig =
            serde_json::from_str(r#"{"task_threads": 4, "runtime": "current"}"#).unwrap();
        assert_eq!(config.task_threads, 4);
        assert_eq!(config.runtime, TaskRuntime::Current);
        assert_eq!(config.capacity, 0);
    }

    #[test]
    fn test_run_config_builders() {
        let config = RunConfig::new()
            .with_capacity(8)
            .with_shutdown_grace(Duration::from_millis(250));
        assert_eq!(config.capacity, 8);
        assert_eq!(config.shutdown_grace_ms, 250);
        assert!(format!("{config:?}").contains("capacity: 8"));
    }

    #[test]
    fn test_log_config_roundtrip() {
        let config = LogConfig::default()
            .with_filter("stagepipe=debug")
            .with_format(LogFormat::Json);
        let json = serde_json::to_string(&config).unwrap();
        let back: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
