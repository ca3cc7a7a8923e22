//! Result cache shared by query commands and the update engine.
//!
//! Entries are stamped with the index generation they were computed
//! against. A completed rebuild clears the whole cache and advances its
//! generation, so a lookup can never return a result computed against an
//! older index.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Receiver of rebuild-completion signals.
///
/// Only the update engine thread calls this.
pub trait Invalidate: Send + Sync {
    fn invalidate(&self, generation: u64);
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub generation: u64,
}

struct CacheInner<V> {
    generation: u64,
    entries: HashMap<String, CacheEntry<V>>,
}

/// Generation-stamped key/value store.
pub struct ResultCache<V> {
    inner: RwLock<CacheInner<V>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Generation of the last invalidation seen by this cache.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Returns the cached value if it was computed against the current generation.
    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.inner.read();
        inner
            .entries
            .get(key)
            .filter(|entry| entry.generation == inner.generation)
            .map(|entry| entry.value.clone())
    }

    /// Returns the raw entry, including stale ones, for callers that check stamps themselves.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Stores `value` stamped with the current generation.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut inner = self.inner.write();
        let generation = inner.generation;
        inner
            .entries
            .insert(key.into(), CacheEntry { value, generation });
    }

    /// Looks `key` up, computing and storing it on a miss.
    ///
    /// The computation runs without holding the lock.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &str,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let generation = self.generation();
        let value = compute()?;
        let mut inner = self.inner.write();
        // A rebuild finished while computing: hand the value back but don't keep it.
        if inner.generation == generation {
            inner.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: value.clone(),
                    generation,
                },
            );
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> Invalidate for ResultCache<V> {
    fn invalidate(&self, generation: u64) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        if generation > inner.generation {
            inner.generation = generation;
        }
        tracing::debug!(generation, "result cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_get() {
        let cache: ResultCache<String> = ResultCache::new();
        cache.insert("find:a.cpp", "x".to_string());
        assert_eq!(cache.get("find:a.cpp").as_deref(), Some("x"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_invalidate_clears_and_advances() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.insert("k", 1);
        cache.invalidate(3);
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 3);

        cache.insert("k", 2);
        let entry = cache.entry("k").unwrap();
        assert_eq!(entry.generation, 3);
        assert_eq!(entry.value, 2);
    }

    #[test]
    fn test_generation_never_moves_backwards() {
        let cache: ResultCache<u32> = ResultCache::new();
        cache.invalidate(5);
        cache.invalidate(2);
        assert_eq!(cache.generation(), 5);
    }

    #[test]
    fn test_get_or_try_insert_with_computes_once() {
        let cache: ResultCache<u32> = ResultCache::new();
        let mut calls = 0;
        let v: Result<u32, ()> = cache.get_or_try_insert_with("k", || {
            calls += 1;
            Ok(7)
        });
        assert_eq!(v, Ok(7));
        let v: Result<u32, ()> = cache.get_or_try_insert_with("k", || {
            calls += 1;
            Ok(8)
        });
        assert_eq!(v, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let cache: ResultCache<u32> = ResultCache::new();
        let v: Result<u32, &str> = cache.get_or_try_insert_with("k", || Err("boom"));
        assert_eq!(v, Err("boom"));
        assert!(cache.is_empty());
    }
}
