//! Reference-counted object cache shared by the graph builder and the executor.
//!
//! The builder binds one reference per planned consumer of a block; each executor
//! read consumes one. An entry whose count reaches zero keeps its handle until the
//! cache is shut down, since several tasks may still race for it.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::feature_tree::FeatureKey;
use crate::interval::Interval;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub feature_key: FeatureKey,
    pub interval: Interval,
}

impl CacheKey {
    pub fn new(feature_key: FeatureKey, interval: Interval) -> Self {
        Self {
            feature_key,
            interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<H> {
    pub ref_count: usize,
    pub handle: Option<H>,
}

#[derive(Debug)]
pub struct ObjectCache<H> {
    entries: Mutex<HashMap<CacheKey, CacheEntry<H>>>,
    final_refs: Mutex<Vec<H>>,
}

impl<H> Default for ObjectCache<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            final_refs: Mutex::new(Vec::new()),
        }
    }
}

impl<H: Clone> ObjectCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more expected consumer of `key`; returns the new count.
    pub fn bind(&self, key: &CacheKey) -> usize {
        let mut entries = self.lock_entries();
        let entry = entries.entry(key.clone()).or_insert(CacheEntry {
            ref_count: 0,
            handle: None,
        });
        entry.ref_count += 1;
        entry.ref_count
    }

    /// Returns the cached handle and decrements its count on a hit.
    ///
    /// On a miss returns `(None, true)`: the caller should compute and [`populate`].
    ///
    /// [`populate`]: ObjectCache::populate
    pub fn check_and_consume(&self, key: &CacheKey) -> (Option<H>, bool) {
        let mut entries = self.lock_entries();
        match entries.get_mut(key) {
            Some(CacheEntry {
                ref_count,
                handle: Some(handle),
            }) => {
                *ref_count = ref_count.saturating_sub(1);
                debug!(
                    component = "cache",
                    event = "cache.hit",
                    interval = %key.interval,
                    remaining_refs = *ref_count
                );
                (Some(handle.clone()), false)
            }
            _ => (None, true),
        }
    }

    pub fn populate(&self, key: &CacheKey, handle: H) {
        let mut entries = self.lock_entries();
        let entry = entries.entry(key.clone()).or_insert(CacheEntry {
            ref_count: 0,
            handle: None,
        });
        entry.handle = Some(handle);
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<H>> {
        self.lock_entries().get(key).cloned()
    }

    pub fn ref_count(&self, key: &CacheKey) -> Option<usize> {
        self.lock_entries().get(key).map(|entry| entry.ref_count)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn record_final_refs(&self, refs: Vec<H>) {
        self.final_refs
            .lock()
            .expect("final refs lock should not be poisoned")
            .extend(refs);
    }

    pub fn get_final_refs(&self) -> Vec<H> {
        self.final_refs
            .lock()
            .expect("final refs lock should not be poisoned")
            .clone()
    }

    /// Drops every entry and hands back the recorded final refs.
    pub fn shutdown(&self) -> Vec<H> {
        let dropped = {
            let mut entries = self.lock_entries();
            let dropped = entries.len();
            entries.clear();
            dropped
        };
        debug!(component = "cache", event = "cache.shutdown", dropped_entries = dropped);
        std::mem::take(
            &mut *self
                .final_refs
                .lock()
                .expect("final refs lock should not be poisoned"),
        )
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry<H>>> {
        self.entries
            .lock()
            .expect("cache entries lock should not be poisoned")
    }
}
