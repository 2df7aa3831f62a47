//! The context every worker of a run carries.

use super::state::PipelineState;
use crate::events::{names, EventSink};
use crate::errors::StageFailure;
use crate::observability::RunStats;
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::error;
use uuid::Uuid;

/// Everything a worker needs to cooperate with the rest of its run.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct RunContext {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Failure and cancellation flags.
    pub state: Arc<PipelineState>,
    /// Per-stage counters.
    pub stats: Arc<RunStats>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventSink>,
    pub(crate) tasks: Option<Handle>,
}

impl RunContext {
    /// Creates a context for a new run.
    #[must_use]
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            state: Arc::new(PipelineState::new()),
            stats: Arc::new(RunStats::new()),
            events,
            tasks: None,
        }
    }

    /// Records a failure, logging it and emitting `stage.failed`.
    ///
    /// Only the first failure of a run is stored; later ones are logged and
    /// dropped.
    pub fn fail(&self, failure: StageFailure) {
        let descriptor = failure.descriptor.clone();
        error!(
            run_id = %self.run_id,
            stage = %descriptor.stage,
            worker = ?descriptor.worker,
            kind = %descriptor.kind,
            panicked = descriptor.panicked,
            "{}", descriptor.message
        );
        if self.state.record_failure(failure) {
            self.emit(
                names::STAGE_FAILED,
                serde_json::to_value(&descriptor).unwrap_or_default(),
            );
        }
    }

    /// Emits an event tagged with the run id without waiting on the sink.
    ///
    /// Used from synchronous code such as spawning and `Drop`.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.events.try_emit(event_type, Some(self.tag(data)));
    }

    /// Emits an event tagged with the run id, awaiting the sink.
    pub async fn publish(&self, event_type: &str, data: serde_json::Value) {
        self.events.emit(event_type, Some(self.tag(data))).await;
    }

    fn tag(&self, data: serde_json::Value) -> serde_json::Value {
        match data {
            serde_json::Value::Object(mut map) => {
                map.insert("run_id".to_string(), json!(self.run_id.to_string()));
                serde_json::Value::Object(map)
            }
            other => json!({ "run_id": self.run_id.to_string(), "data": other }),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("failed", &self.state.is_failed())
            .field("cancelled", &self.state.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::events::CollectingEventSink;
    use serde_json::Value;

    #[test]
    fn test_fail_emits_once() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = RunContext::new(sink.clone());

        ctx.fail(StageFailure::new("map-1", Some(2), FailureKind::WorkerFn, anyhow::anyhow!("x")));
        ctx.fail(StageFailure::new("map-1", Some(0), FailureKind::WorkerFn, anyhow::anyhow!("y")));

        assert!(ctx.state.is_failed());
        let failed = sink.events_of_type(names::STAGE_FAILED);
        assert_eq!(failed.len(), 1);
        let data = failed[0].1.clone().unwrap();
        assert_eq!(data["worker"], 2);
        assert_eq!(data["run_id"], ctx.run_id.to_string());
    }

    #[test]
    fn test_emit_wraps_non_objects() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = RunContext::new(sink.clone());
        ctx.emit("custom", json!(3));
        assert_eq!(sink.events()[0].1.as_ref().unwrap()["data"], 3);
    }

    /// Records only events delivered through the awaited `emit`.
    #[derive(Default)]
    struct AwaitedOnly {
        events: parking_lot::Mutex<Vec<(String, Value)>>,
    }

    #[async_trait::async_trait]
    impl EventSink for AwaitedOnly {
        async fn emit(&self, event_type: &str, data: Option<Value>) {
            self.events
                .lock()
                .push((event_type.to_string(), data.unwrap_or(Value::Null)));
        }

        fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
    }

    #[tokio::test]
    async fn test_publish_goes_through_async_emit() {
        let sink = Arc::new(AwaitedOnly::default());
        let ctx = RunContext::new(sink.clone());
        ctx.emit("ignored", json!({}));
        ctx.publish(names::WORKER_STARTED, json!({ "stage": "map-1" })).await;

        let events = sink.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, names::WORKER_STARTED);
        assert_eq!(events[0].1["stage"], "map-1");
        assert_eq!(events[0].1["run_id"], ctx.run_id.to_string());
    }
}
