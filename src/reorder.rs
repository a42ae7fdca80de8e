//! Byte-reordering tree: trade range scans for insert scalability.
//!
//! A thin adapter that swaps the most and least significant bytes of
//! every key on the way in and out. The permutation is injective and its
//! own inverse, so point operations behave exactly as on the wrapped
//! tree. A monotonically increasing key stream scatters uniformly across
//! leaves instead of hammering the rightmost one, which removes
//! tail-insertion contention entirely.
//!
//! The permutation does not preserve order: `scan` walks the transformed
//! keyspace, so the payloads it returns follow no meaningful user-key
//! order.

use crate::index::ConcurrentIndex;
use crate::key::{IndexKey, ReorderBytes};
use crate::tree::BTree;
use crate::value::Payload;

/// A B+-tree storing keys with their extremal bytes swapped.
pub struct ByteReorderTree<K: IndexKey, V: Payload, const CAP: usize = 255> {
    tree: BTree<K, V, CAP>,
}

impl<K, V, const CAP: usize> ByteReorderTree<K, V, CAP>
where
    K: IndexKey + ReorderBytes,
    V: Payload,
{
    #[must_use]
    pub fn new() -> Self {
        Self { tree: BTree::new() }
    }

    /// Associate `k` with `v`, overwriting any existing payload.
    pub fn insert(&self, k: K, v: V) {
        self.tree.insert(k.reorder(), v);
    }

    /// Return the payload associated with `k`, if any.
    pub fn lookup(&self, k: K) -> Option<V> {
        self.tree.lookup(k.reorder())
    }

    /// Copy up to `out.len()` payloads into `out`, starting from the
    /// least *transformed* key `>= k.reorder()`.
    ///
    /// Present for interface parity only: the results follow the
    /// transformed key order, which is meaningless to callers thinking in
    /// user keys.
    pub fn scan(&self, k: K, out: &mut [V]) -> usize {
        self.tree.scan(k.reorder(), out)
    }
}

impl<K, V, const CAP: usize> Default for ByteReorderTree<K, V, CAP>
where
    K: IndexKey + ReorderBytes,
    V: Payload,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const CAP: usize> ConcurrentIndex<K, V> for ByteReorderTree<K, V, CAP>
where
    K: IndexKey + ReorderBytes,
    V: Payload,
{
    fn insert(&self, key: K, value: V) {
        ByteReorderTree::insert(self, key, value);
    }

    fn lookup(&self, key: K) -> Option<V> {
        ByteReorderTree::lookup(self, key)
    }

    fn scan(&self, key: K, out: &mut [V]) -> usize {
        ByteReorderTree::scan(self, key, out)
    }
}
