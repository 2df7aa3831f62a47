//! Per-worker resources produced by `on_start`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Named values a worker's `on_start` hook hands to its worker function and
/// its `on_done` hook.
///
/// Each worker owns its own bag, so values are not shared between workers
/// unless the hook puts the same `Arc` into several bags.
#[derive(Clone, Default)]
pub struct WorkerBag {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl WorkerBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, builder style.
    #[must_use]
    pub fn with<V: Any + Send + Sync>(mut self, key: impl Into<String>, value: V) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a value, replacing any previous value under the same key.
    pub fn insert<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Gets a value by key if it has type `V`.
    #[must_use]
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|value| value.downcast_ref::<V>())
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for WorkerBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerBag").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_bag_typed_get() {
        let bag = WorkerBag::new().with("offset", 10_i64).with("label", "x".to_string());

        assert_eq!(bag.get::<i64>("offset"), Some(&10));
        assert_eq!(bag.get::<String>("label").map(String::as_str), Some("x"));
        assert!(bag.get::<i32>("offset").is_none());
        assert!(bag.get::<i64>("missing").is_none());
        assert_eq!(bag.keys(), vec!["label", "offset"]);
    }

    #[test]
    fn test_bag_shares_arc_values() {
        let counter = Arc::new(AtomicUsize::new(0));
        let bag = WorkerBag::new().with("counter", counter.clone());

        bag.get::<Arc<AtomicUsize>>("counter")
            .unwrap()
            .fetch_add(1, Ordering::SeqCst);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bag_insert_replaces() {
        let mut bag = WorkerBag::new();
        assert!(bag.is_empty());
        bag.insert("n", 1_u8);
        bag.insert("n", 2_u8);
        assert_eq!(bag.len(), 1);
        assert!(bag.contains_key("n"));
        assert_eq!(bag.get::<u8>("n"), Some(&2));
    }
}
