//! Per-stage counters for a single run.
//!
//! Every stage registers one [`StageCounters`] when the queue network is
//! materialized. The counters record how many Done tokens the stage expects
//! and has received, which makes the termination protocol observable.

use crate::core::StageKind;
use crate::pipeline::{StageConfig, StageId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Live counters for one stage.
#[derive(Debug)]
pub struct StageCounters {
    id: StageId,
    name: String,
    kind: Option<StageKind>,
    workers: usize,
    expected_done: usize,
    done_received: AtomicUsize,
    items_received: AtomicUsize,
    items_emitted: AtomicUsize,
    active_workers: AtomicUsize,
}

impl StageCounters {
    fn new(id: StageId, name: String, kind: Option<StageKind>, workers: usize, expected_done: usize) -> Self {
        Self {
            id,
            name,
            kind,
            workers,
            expected_done,
            done_received: AtomicUsize::new(0),
            items_received: AtomicUsize::new(0),
            items_emitted: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
        }
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Done tokens the stage must see before its input is exhausted.
    #[must_use]
    pub const fn expected_done(&self) -> usize {
        self.expected_done
    }

    pub(crate) fn record_done(&self) -> usize {
        self.done_received.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_received(&self) {
        self.items_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.items_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of workers still running after this one.
    pub(crate) fn worker_exited(&self) -> usize {
        self.active_workers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    /// Takes a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            id: self.id.get(),
            name: self.name.clone(),
            kind: self.kind,
            workers: self.workers,
            expected_done: self.expected_done,
            done_received: self.done_received.load(Ordering::SeqCst),
            items_received: self.items_received.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::SeqCst),
        }
    }
}

/// Serializable copy of a stage's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Stage id.
    pub id: u64,
    /// Stage name.
    pub name: String,
    /// Stage kind; `None` for the drain.
    pub kind: Option<StageKind>,
    /// Configured workers; 0 for the drain.
    pub workers: usize,
    /// Done tokens expected on the merged input.
    pub expected_done: usize,
    /// Done tokens received so far.
    pub done_received: usize,
    /// Data items pulled from the merged input.
    pub items_received: usize,
    /// Data items delivered to the fan-out (counted once per item, not per edge).
    pub items_emitted: usize,
    /// Workers currently running.
    pub active_workers: usize,
}

impl StageSnapshot {
    /// Returns true once every expected Done token has arrived.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.done_received >= self.expected_done
    }
}

/// Counters for every stage of one run, keyed by stage id.
#[derive(Debug, Default)]
pub struct RunStats {
    stages: DashMap<StageId, Arc<StageCounters>>,
}

impl RunStats {
    /// Creates an empty stats table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, config: &StageConfig, expected_done: usize) -> Arc<StageCounters> {
        self.stages
            .entry(config.id)
            .or_insert_with(|| {
                Arc::new(StageCounters::new(
                    config.id,
                    config.name.clone(),
                    Some(config.kind),
                    config.workers,
                    expected_done,
                ))
            })
            .clone()
    }

    pub(crate) fn register_drain(&self, expected_done: usize) -> Arc<StageCounters> {
        let counters = Arc::new(StageCounters::new(
            StageId::DRAIN,
            "drain".to_string(),
            None,
            0,
            expected_done,
        ));
        self.stages.insert(StageId::DRAIN, counters.clone());
        counters
    }

    pub(crate) fn counters(&self, id: StageId) -> Option<Arc<StageCounters>> {
        self.stages.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns a snapshot for the stage with this name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<StageSnapshot> {
        self.stages
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| entry.value().snapshot())
    }

    /// Returns a snapshot of the drain's own input.
    #[must_use]
    pub fn drain(&self) -> Option<StageSnapshot> {
        self.counters(StageId::DRAIN).map(|counters| counters.snapshot())
    }

    /// Returns snapshots of every stage, ordered by stage id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        let mut snapshots: Vec<StageSnapshot> =
            self.stages.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Number of registered stages, including the drain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Substrate;

    fn config(name: &str, workers: usize) -> StageConfig {
        StageConfig::new(StageKind::Transform, workers, 0, Substrate::Thread).with_name(name)
    }

    #[test]
    fn test_register_is_idempotent() {
        let stats = RunStats::new();
        let cfg = config("double", 3);
        let first = stats.register(&cfg, 2);
        let second = stats.register(&cfg, 99);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.expected_done(), 2);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_counters_snapshot() {
        let stats = RunStats::new();
        let counters = stats.register(&config("double", 2), 1);
        counters.worker_started();
        counters.worker_started();
        counters.record_received();
        counters.record_emitted();
        assert_eq!(counters.record_done(), 1);
        assert_eq!(counters.worker_exited(), 1);

        let snapshot = stats.stage("double").unwrap();
        assert_eq!(snapshot.workers, 2);
        assert_eq!(snapshot.items_received, 1);
        assert_eq!(snapshot.items_emitted, 1);
        assert_eq!(snapshot.active_workers, 1);
        assert!(snapshot.is_exhausted());
    }

    #[test]
    fn test_drain_sorts_first() {
        let stats = RunStats::new();
        stats.register(&config("b", 1), 1);
        stats.register_drain(1);

        let all = stats.snapshot();
        assert_eq!(all[0].name, "drain");
        assert_eq!(all[0].kind, None);
        assert!(stats.drain().is_some());
    }
}
