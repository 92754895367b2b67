//! Cache store: values, not-found markers and per-key error history
//!
//! One record per key, in at most one of three states: value present,
//! not-found, or unknown (absent). Orthogonally the store keeps the pending
//! map (keys currently in flight upstream) and the error history used by the
//! dispatcher's back-off check.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Instant;

/// Cached results and per-key request state
pub(crate) struct CacheStore<K, V> {
    values: HashMap<K, V>,
    not_found: HashSet<K>,
    last_error: HashMap<K, Instant>,
    error_count: HashMap<K, u32>,
    pending: HashMap<K, Instant>,
}

impl<K, V> CacheStore<K, V>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            not_found: HashSet::new(),
            last_error: HashMap::new(),
            error_count: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn value(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    pub fn has_value(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_not_found(&self, key: &K) -> bool {
        self.not_found.contains(key)
    }

    /// Record a successful value. Clears the not-found marker and the
    /// consecutive error count for the key.
    pub fn insert_value(&mut self, key: K, value: V) {
        self.error_count.remove(&key);
        self.not_found.remove(&key);
        self.values.insert(key, value);
    }

    /// Record a permanent not-found resolution. Clears the error count.
    pub fn insert_not_found(&mut self, key: K) {
        self.error_count.remove(&key);
        self.not_found.insert(key);
    }

    /// Record a transient error. The cached value, if any, is retained.
    pub fn record_error(&mut self, key: K) {
        *self.error_count.entry(key.clone()).or_insert(0) += 1;
        self.last_error.insert(key, Instant::now());
    }

    /// Drop the cached value for a key. Not-found and error history survive.
    pub fn evict_value(&mut self, key: &K) {
        self.values.remove(key);
    }

    pub fn mark_pending(&mut self, key: K) {
        self.pending.insert(key, Instant::now());
    }

    pub fn clear_pending(&mut self, key: &K) {
        self.pending.remove(key);
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn error_count(&self, key: &K) -> u32 {
        self.error_count.get(key).copied().unwrap_or(0)
    }

    /// Whole seconds since the most recent transient error for the key, or
    /// `None` if the key has never errored.
    pub fn seconds_since_error(&self, key: &K) -> Option<u64> {
        self.last_error.get(key).map(|at| at.elapsed().as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_clears_not_found_and_errors() {
        let mut store: CacheStore<&str, i64> = CacheStore::new();
        store.insert_not_found("a");
        store.record_error("a");
        assert!(store.is_not_found(&"a"));

        store.insert_value("a", 1);
        assert_eq!(store.value(&"a"), Some(&1));
        assert!(!store.is_not_found(&"a"));
        assert_eq!(store.error_count(&"a"), 0);
    }

    #[test]
    fn test_not_found_clears_error_count() {
        let mut store: CacheStore<&str, i64> = CacheStore::new();
        store.record_error("a");
        store.record_error("a");
        assert_eq!(store.error_count(&"a"), 2);

        store.insert_not_found("a");
        assert_eq!(store.error_count(&"a"), 0);
        assert!(store.is_not_found(&"a"));
    }

    #[test]
    fn test_error_retains_cached_value() {
        let mut store: CacheStore<&str, i64> = CacheStore::new();
        store.insert_value("a", 7);
        store.record_error("a");

        assert_eq!(store.value(&"a"), Some(&7));
        assert_eq!(store.error_count(&"a"), 1);
        assert!(store.seconds_since_error(&"a").is_some());
    }

    #[test]
    fn test_evict_value_keeps_history() {
        let mut store: CacheStore<&str, i64> = CacheStore::new();
        store.insert_value("a", 7);
        store.record_error("b");
        store.insert_not_found("c");

        store.evict_value(&"a");
        store.evict_value(&"b");
        store.evict_value(&"c");

        assert!(!store.has_value(&"a"));
        assert_eq!(store.error_count(&"b"), 1);
        assert!(store.is_not_found(&"c"));
    }

    #[test]
    fn test_pending_tracking() {
        let mut store: CacheStore<&str, i64> = CacheStore::new();
        assert!(!store.is_pending(&"a"));

        store.mark_pending("a");
        store.mark_pending("b");
        assert!(store.is_pending(&"a"));
        assert_eq!(store.pending_len(), 2);

        store.clear_pending(&"a");
        assert!(!store.is_pending(&"a"));
        assert_eq!(store.pending_len(), 1);
    }

    #[test]
    fn test_seconds_since_error_absent() {
        let store: CacheStore<&str, i64> = CacheStore::new();
        assert_eq!(store.seconds_since_error(&"a"), None);
    }
}
