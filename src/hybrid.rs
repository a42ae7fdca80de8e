//! Hybrid tree: the B+-tree plus a write cache for hot key ranges.
//!
//! Sequential and skewed insert workloads hammer a handful of leaves; the
//! hybrid variant diverts writes to those ranges into the [`HotCache`]
//! instead of the tree, guided by the [`WorkingSet`]'s recency tracking.
//! When the working set overflows, the least recently touched range is
//! purged: its cached entries are bulk-inserted into the tree and the
//! range is forgotten.
//!
//! # Locking
//!
//! A single read-write "big lock" guards policy and cache transitions.
//! Every insert consults the policy under the read side; a purge runs
//! under the write side, so it excludes all policy consultations but
//! nothing else. Lookups take the big lock in neither mode; they probe
//! the cache (internally synchronised) and then the tree. Lock order is
//! always big lock first, then tree node locks.
//!
//! # Visibility
//!
//! Every inserted key is present in the tree or the cache at all times
//! (both, briefly, while a purge installs entries it has not yet erased),
//! so point lookups never lose a key. Range scans read only the tree and
//! may therefore miss keys currently absorbed by the cache.

use parking_lot::RwLock;

use crate::backoff::Backoff;
use crate::hc::HotCache;
use crate::index::ConcurrentIndex;
use crate::key::RangeKey;
use crate::lock::{OptResult, Restart};
use crate::tracing_helpers::debug_log;
use crate::tree::{BTree, LeafBounds, Route};
use crate::value::Payload;
use crate::ws::WorkingSet;

/// A concurrent B+-tree that absorbs writes to hot key ranges in a cache.
///
/// `N` bounds how many ranges the working set tracks at once; `CAP` is
/// the tree's per-node entry capacity.
pub struct HybridTree<K: RangeKey, V: Payload, const N: usize = 10, const CAP: usize = 255> {
    tree: BTree<K, V, CAP>,
    ws: WorkingSet<K, N>,
    hc: HotCache<K, V>,
    big: RwLock<()>,
}

impl<K: RangeKey, V: Payload, const N: usize, const CAP: usize> HybridTree<K, V, N, CAP> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: BTree::new(),
            ws: WorkingSet::new(),
            hc: HotCache::new(),
            big: RwLock::new(()),
        }
    }

    /// Associate `k` with `v`, overwriting any existing payload.
    ///
    /// The write lands in the tree unless `k` falls in a hot range, in
    /// which case it is absorbed by the cache until that range is purged.
    pub fn insert(&self, k: K, v: V) {
        let mut backoff = Backoff::new();
        loop {
            match self.insert_attempt(k, v) {
                Ok(()) => return,
                Err(Restart) => backoff.wait(),
            }
        }
    }

    fn insert_attempt(&self, k: K, v: V) -> OptResult<()> {
        let mut gate = |bounds: Option<&LeafBounds<K>>| -> Route {
            // A root leaf takes writes directly; caching only pays off
            // once the tree has fanned out.
            let Some(bounds) = bounds else {
                return Route::Tree;
            };

            let read_guard = self.big.read();
            if self.ws.needs_purge() {
                drop(read_guard);
                let _write_guard = self.big.write();
                // Re-check: another thread may have purged while we
                // waited for the writer side.
                if self.ws.needs_purge() {
                    self.purge();
                }
                return Route::Restart;
            }

            // The leaf's separator bounds become the hot-range candidate.
            // A missing bound (leftmost or rightmost leaf) is invented one
            // node-span away from the other.
            let (low, high) = match (bounds.lower, bounds.upper) {
                (Some(low), Some(high)) => (low, high),
                (None, Some(high)) => (high.sub_span(CAP), high),
                (Some(low), None) => (low, low.add_span(CAP)),
                (None, None) => return Route::Tree,
            };

            if self.ws.touch(low, high, k) {
                self.hc.insert(k, v);
                Route::Absorbed
            } else {
                Route::Tree
            }
        };
        self.tree.insert_attempt(k, v, &mut gate)
    }

    /// Move the least recently used range's cached entries back into the
    /// tree and forget the range. Caller holds the big lock for writing.
    fn purge(&self) {
        let Some((low, high)) = self.ws.purge_range() else {
            return;
        };
        let entries = self.hc.snapshot_range(low, high);
        debug_log!(?low, ?high, count = entries.len(), "purging hot range");

        let keys: Vec<K> = entries.iter().map(|(k, _)| *k).collect();
        // Install first, erase second: a key stays visible in at least
        // one of the two structures throughout.
        self.tree.bulk_insert(entries);
        for k in keys {
            self.hc.erase(k);
        }
        self.ws.remove(low, high);
    }

    /// Return the payload associated with `k`, if any.
    ///
    /// The cache is probed first, then the tree; no big-lock acquisition
    /// on this path.
    pub fn lookup(&self, k: K) -> Option<V> {
        if let Some(v) = self.hc.find(k) {
            return Some(v);
        }
        self.tree.lookup(k)
    }

    /// Copy up to `out.len()` payloads into `out`, starting from the
    /// least key `>= k` within a single tree leaf.
    ///
    /// The scan reads only the tree: keys currently absorbed by the cache
    /// are not observed until their range is purged.
    pub fn scan(&self, k: K, out: &mut [V]) -> usize {
        self.tree.scan(k, out)
    }
}

impl<K: RangeKey, V: Payload, const N: usize, const CAP: usize> Default
    for HybridTree<K, V, N, CAP>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RangeKey, V: Payload, const N: usize, const CAP: usize> ConcurrentIndex<K, V>
    for HybridTree<K, V, N, CAP>
{
    fn insert(&self, key: K, value: V) {
        HybridTree::insert(self, key, value);
    }

    fn lookup(&self, key: K) -> Option<V> {
        HybridTree::lookup(self, key)
    }

    fn scan(&self, key: K, out: &mut [V]) -> usize {
        HybridTree::scan(self, key, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small fan-out and policy so tests reach splits and purges quickly.
    type SmallHybrid = HybridTree<u64, u64, 4, 8>;

    #[test]
    fn insert_then_lookup() {
        let tree = SmallHybrid::new();
        tree.insert(0, 0);
        assert_eq!(tree.lookup(0), Some(0));
        assert_eq!(tree.lookup(1), None);
    }

    #[test]
    fn every_key_lands_in_tree_or_cache() {
        let tree = SmallHybrid::new();
        for k in 0..5_000u64 {
            tree.insert(k, k);
        }
        for k in 0..5_000u64 {
            assert!(
                tree.hc.find(k).is_some() || tree.tree.lookup(k).is_some(),
                "key {k} in neither tree nor cache"
            );
            assert_eq!(tree.lookup(k), Some(k));
        }
        tree.tree.debug_assert_invariants();
    }

    #[test]
    fn repeated_upserts_stay_current() {
        let tree = SmallHybrid::new();
        for round in 0..20u64 {
            for k in 0..500u64 {
                tree.insert(k, k + round);
            }
        }
        for k in 0..500u64 {
            assert_eq!(tree.lookup(k), Some(k + 19));
        }
    }

    #[test]
    fn purge_moves_a_range_from_cache_to_tree() {
        let tree = SmallHybrid::new();

        // Make [100, 200) a tracked hot range with cached writes.
        assert!(tree.ws.touch(100, 200, 150));
        for k in 150..160u64 {
            tree.hc.insert(k, k * 2);
            assert!(tree.ws.touch(100, 200, k));
        }
        assert_eq!(tree.hc.len(), 10);

        {
            let _guard = tree.big.write();
            tree.purge();
        }

        // Cache emptied, range forgotten, keys findable through the tree.
        assert!(tree.hc.is_empty());
        for k in 150..160u64 {
            assert_eq!(tree.hc.find(k), None);
            assert_eq!(tree.tree.lookup(k), Some(k * 2));
            assert_eq!(tree.lookup(k), Some(k * 2));
        }
        tree.tree.debug_assert_invariants();
    }

    #[test]
    fn purge_prefers_the_least_recent_range() {
        let tree = SmallHybrid::new();

        // Fill the policy with four ranges, caching one key in each.
        for i in 0..4u64 {
            let low = i * 100;
            assert!(tree.ws.touch(low, low + 100, low + 1));
            tree.hc.insert(low + 1, i);
        }
        // Rewarm everything except the second range.
        for i in [0u64, 2, 3] {
            assert!(tree.ws.touch(i * 100, i * 100 + 100, i * 100 + 1));
        }

        {
            let _guard = tree.big.write();
            tree.purge();
        }

        assert_eq!(tree.hc.find(101), None);
        assert_eq!(tree.tree.lookup(101), Some(1));
        for i in [0u64, 2, 3] {
            assert_eq!(tree.hc.find(i * 100 + 1), Some(i));
        }
    }

    #[test]
    fn scan_reads_the_tree_only() {
        let tree = SmallHybrid::new();
        for k in 0..200u64 {
            tree.insert(k, k);
        }

        // Whatever the cache absorbed is invisible to scan; everything it
        // returns must come from the tree in tree order.
        let mut out = [0u64; 8];
        let read = tree.scan(0, &mut out);
        for pair in out[..read].windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for v in &out[..read] {
            assert_eq!(tree.tree.lookup(*v), Some(*v));
        }
    }
}
