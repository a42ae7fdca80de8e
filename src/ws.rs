//! Working set: approximate LRU over hot key ranges.
//!
//! Tracks at most `N` key ranges `[low, high)`. Recency is kept in an
//! atomic counter per slot fed from a monotonic clock; no linked list is
//! materialised, so publishing a fresh recency stamp on the hot path is a
//! single relaxed store. Slot allocation and the range index are guarded
//! by a read-write lock whose write side doubles as the allocation mutex.
//!
//! Two threads stamping the same slot can interleave so that the older
//! stamp wins. That is tolerated: the worst case is an earlier eviction
//! of a still-warm range.
//!
//! A candidate range that partially overlaps a tracked one is rejected
//! rather than merged; the caller falls back to the tree for that write.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

use parking_lot::RwLock;

use crate::key::IndexKey;
use crate::ordering::RELAXED;
use crate::tracing_helpers::trace_log;

struct TrackedRange<K> {
    high: K,
    slot: usize,
}

/// Slot table plus the ordered range index keyed by low key.
struct RangeIndex<K, const N: usize> {
    by_low: BTreeMap<K, TrackedRange<K>>,
    slots: [Option<(K, K)>; N],
}

impl<K: IndexKey, const N: usize> RangeIndex<K, N> {
    /// Slot of the tracked range containing `k`, if any.
    fn find(&self, k: K) -> Option<usize> {
        let (_, tracked) = self.by_low.range(..=k).next_back()?;
        (k < tracked.high).then_some(tracked.slot)
    }

    /// Whether `[kl, kh)` intersects any tracked range.
    fn overlaps(&self, kl: K, kh: K) -> bool {
        self.find(kl).is_some() || self.by_low.range(kl..kh).next().is_some()
    }
}

/// Fixed-capacity recency tracker for hot key ranges.
pub struct WorkingSet<K, const N: usize> {
    index: RwLock<RangeIndex<K, N>>,
    counters: [AtomicU64; N],
    /// Monotonic recency clock; 0 is reserved to mean "slot free".
    next: AtomicU64,
    occupied: AtomicUsize,
    needs_purge: AtomicBool,
}

impl<K: IndexKey, const N: usize> WorkingSet<K, N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: RwLock::new(RangeIndex {
                by_low: BTreeMap::new(),
                slots: [None; N],
            }),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            next: AtomicU64::new(1),
            occupied: AtomicUsize::new(0),
            needs_purge: AtomicBool::new(false),
        }
    }

    /// Register a touch of `k`, offering `[kl, kh)` as the range to track
    /// if `k` is not yet covered.
    ///
    /// Returns `true` when `k` now lies in a tracked range (it is hot).
    /// Returns `false` when the structure is full (and flags that a purge
    /// is due) or when the offered range overlaps a tracked one.
    pub fn touch(&self, kl: K, kh: K, k: K) -> bool {
        if let Some(slot) = self.index.read().find(k) {
            self.stamp(slot);
            return true;
        }

        let mut index = self.index.write();
        // Someone else may have tracked a covering range since the read.
        if let Some(slot) = index.find(k) {
            self.stamp(slot);
            return true;
        }

        if self.occupied.load(RELAXED) == N {
            self.needs_purge.store(true, RELAXED);
            return false;
        }
        if kl >= kh || index.overlaps(kl, kh) {
            return false;
        }

        // A zero counter marks a free slot; one exists because occupancy
        // is below N and transitions are serialised by the write lock.
        let Some(slot) = (0..N).find(|&i| self.counters[i].load(RELAXED) == 0) else {
            return false;
        };

        trace_log!(slot, ?kl, ?kh, "tracking hot range");
        index.slots[slot] = Some((kl, kh));
        index.by_low.insert(kl, TrackedRange { high: kh, slot });
        self.occupied.fetch_add(1, RELAXED);
        self.stamp(slot);
        true
    }

    /// Publish a fresh recency stamp for `slot`.
    ///
    /// Not atomic with respect to a concurrent stamp of the same slot;
    /// the older stamp may win, which only hastens that range's eviction.
    fn stamp(&self, slot: usize) {
        self.counters[slot].store(self.next.fetch_add(1, RELAXED), RELAXED);
    }

    /// Whether the set is full and a touch has been refused since the
    /// last removal.
    pub fn needs_purge(&self) -> bool {
        self.occupied.load(RELAXED) == N && self.needs_purge.load(RELAXED)
    }

    /// The least recently touched range, the candidate for eviction.
    ///
    /// Call only while transitions are externally excluded (the hybrid
    /// tree's big lock held for writing), so the returned range cannot be
    /// concurrently removed.
    pub fn purge_range(&self) -> Option<(K, K)> {
        let index = self.index.read();
        let mut best: Option<(u64, usize)> = None;
        for slot in 0..N {
            let stamp = self.counters[slot].load(RELAXED);
            if stamp != 0 && best.map_or(true, |(b, _)| stamp < b) {
                best = Some((stamp, slot));
            }
        }
        best.and_then(|(_, slot)| index.slots[slot])
    }

    /// Stop tracking `[kl, kh)` and clear the purge flag.
    ///
    /// Same exclusion requirement as [`purge_range`](Self::purge_range).
    pub fn remove(&self, kl: K, kh: K) {
        let mut index = self.index.write();
        if let Some(tracked) = index.by_low.remove(&kl) {
            debug_assert!(tracked.high == kh, "removing a range that was never tracked");
            index.slots[tracked.slot] = None;
            self.counters[tracked.slot].store(0, RELAXED);
            self.occupied.fetch_sub(1, RELAXED);
        }
        self.needs_purge.store(false, RELAXED);
    }
}

impl<K: IndexKey, const N: usize> Default for WorkingSet<K, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 10;
    type Ws = WorkingSet<u64, N>;

    #[test]
    fn fills_evicts_lru_and_keeps_warm_ranges() {
        let ws = Ws::new();

        // First range goes in and its keys stay hot across repeat touches.
        assert!(ws.touch(0, 10, 1));
        for _ in 0..2 * N {
            assert!(ws.touch(0, 10, 1));
        }

        // Fill the remaining slots.
        for i in 1..N as u64 {
            assert!(ws.touch(i * 10, i * 10 + 10, i * 10));
        }
        assert!(!ws.needs_purge());

        // One more range is refused and arms the purge flag; the eviction
        // candidate is the least recently touched range, which is [0, 10)
        // because every later range was stamped after its touches.
        assert!(!ws.touch(N as u64 * 10, N as u64 * 10 + 10, N as u64 * 10));
        assert!(ws.needs_purge());
        assert_eq!(ws.purge_range(), Some((0, 10)));

        // Still-tracked ranges keep answering touches.
        assert!(ws.touch(10, 20, 15));
    }

    #[test]
    fn remove_frees_a_slot_and_clears_the_flag() {
        let ws = Ws::new();
        for i in 0..N as u64 {
            assert!(ws.touch(i * 10, i * 10 + 10, i * 10));
        }
        assert!(!ws.touch(1000, 1010, 1000));
        assert!(ws.needs_purge());

        ws.remove(0, 10);
        assert!(!ws.needs_purge());

        // The freed slot accepts a new range.
        assert!(ws.touch(1000, 1010, 1000));

        // The removed range's keys are no longer hot: touching one now
        // offers a fresh range, which is refused because the set is full
        // again.
        assert!(!ws.touch(0, 10, 5));
    }

    #[test]
    fn partially_overlapping_ranges_are_rejected() {
        let ws = Ws::new();
        assert!(ws.touch(10, 20, 12));

        // Overlap from either side, containment, and degenerate ranges.
        assert!(!ws.touch(15, 25, 22));
        assert!(!ws.touch(5, 12, 6));
        assert!(!ws.touch(0, 100, 50));
        assert!(!ws.touch(30, 30, 30));

        // Disjoint neighbours are fine, including one that starts exactly
        // at the tracked range's exclusive high end.
        assert!(ws.touch(20, 30, 25));
    }

    #[test]
    fn purge_candidate_tracks_recency_not_insertion_order() {
        let ws = Ws::new();
        for i in 0..N as u64 {
            assert!(ws.touch(i * 10, i * 10 + 10, i * 10));
        }
        // Rewarm the oldest range; the second-oldest becomes the victim.
        assert!(ws.touch(0, 10, 5));
        assert!(!ws.touch(1000, 1010, 1000));
        assert_eq!(ws.purge_range(), Some((10, 20)));
    }

    #[test]
    fn empty_set_has_no_purge_candidate() {
        let ws = Ws::new();
        assert!(!ws.needs_purge());
        assert_eq!(ws.purge_range(), None);
    }
}
