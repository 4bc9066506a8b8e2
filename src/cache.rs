//! Memoizing layer in front of the rule set.

use crate::rules::Direction;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Cache of already-rewritten strings, keyed by direction and original text.
///
/// Entries live as long as the cache; nothing is evicted.
#[derive(Debug, Default)]
pub struct TextCache {
    entries: RwLock<HashMap<(Direction, String), String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TextCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached rewrite of `original`, computing it on first use.
    ///
    /// Empty and whitespace-only input maps to itself without calling `compute`.
    pub fn get_or_compute<F>(&self, original: &str, direction: Direction, compute: F) -> String
    where
        F: FnOnce(&str) -> String,
    {
        let key = (direction, original.to_string());

        if let Some(hit) = self.entries.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return hit.clone();
        }

        let mut entries = self.entries.write();
        // Another task may have filled the slot between the two locks
        if let Some(hit) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return hit.clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rewritten = if original.trim().is_empty() {
            original.to_string()
        } else {
            compute(original)
        };
        trace!(%direction, len = original.len(), "Text cache miss");
        entries.insert(key, rewritten.clone());
        rewritten
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to compute.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_compute_once() {
        let cache = TextCache::new();
        let calls = Cell::new(0);
        let compute = |s: &str| {
            calls.set(calls.get() + 1);
            s.to_uppercase()
        };

        assert_eq!(cache.get_or_compute("abc", Direction::Outbound, compute), "ABC");
        assert_eq!(cache.get_or_compute("abc", Direction::Outbound, compute), "ABC");
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keyed_by_direction() {
        let cache = TextCache::new();
        cache.get_or_compute("abc", Direction::Outbound, |_| "out".to_string());
        let inbound = cache.get_or_compute("abc", Direction::Inbound, |_| "in".to_string());
        assert_eq!(inbound, "in");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_whitespace_identity() {
        let cache = TextCache::new();
        let result = cache.get_or_compute("  \n", Direction::Outbound, |_| {
            panic!("compute must not run for blank input")
        });
        assert_eq!(result, "  \n");
        assert_eq!(cache.get_or_compute("", Direction::Outbound, |_| "x".to_string()), "");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let cache = TextCache::new();
        cache.get_or_compute("abc", Direction::Outbound, |s| s.to_string());
        cache.get_or_compute("abc", Direction::Outbound, |s| s.to_string());
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 0);
    }
}
