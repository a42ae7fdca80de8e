//! Hot cache: the concurrent map absorbing writes to hot ranges.
//!
//! A plain key-to-payload hash map with fine-grained bucket locking; it
//! carries no ordering of its own and relies on the working set to know
//! which ranges it currently holds. Lookups return payloads by copy so a
//! concurrent eviction cannot invalidate anything handed out.

use std::hash::Hash;

use dashmap::DashMap;

use crate::key::IndexKey;
use crate::value::Payload;

/// Concurrent key-to-payload cache for keys diverted from the tree.
pub struct HotCache<K: Eq + Hash, V> {
    map: DashMap<K, V>,
}

impl<K: IndexKey, V: Payload> HotCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Insert or overwrite.
    pub fn insert(&self, k: K, v: V) {
        self.map.insert(k, v);
    }

    /// The payload for `k`, copied out, if present.
    pub fn find(&self, k: K) -> Option<V> {
        self.map.get(&k).map(|entry| *entry.value())
    }

    /// Remove `k` if present.
    pub fn erase(&self, k: K) {
        self.map.remove(&k);
    }

    /// Every cached entry whose key lies in `[kl, kh)`.
    ///
    /// Consistency of the snapshot comes from the caller excluding cache
    /// inserts (the hybrid tree holds its big lock for writing during a
    /// purge); concurrent lookups are unaffected.
    pub fn snapshot_range(&self, kl: K, kh: K) -> Vec<(K, V)> {
        self.map
            .iter()
            .filter(|entry| {
                let k = *entry.key();
                kl <= k && k < kh
            })
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: IndexKey, V: Payload> Default for HotCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
