//! The optimistic-lock-coupled B+-tree.
//!
//! Writers hold at most two node locks at a time while descending; readers
//! hold none and instead validate lock versions. Any observed interference
//! surfaces as a [`Restart`] that the public operations consume by retrying
//! from the root with back-off.
//!
//! # Descent
//!
//! A traversal carries the current node's version and its parent's. Before
//! acting on anything derived from a node it re-checks that node's version;
//! before abandoning the parent it releases the parent's optimistic read.
//! Inner nodes that would overflow are split eagerly on the way down, so an
//! insert arriving at a leaf only ever needs that leaf (plus, for splits,
//! its immediate parent).
//!
//! # Root replacement
//!
//! The root pointer is an `AtomicPtr` replaced wholesale when the root
//! splits. A descent that read the root before the swap notices either the
//! pointer change (checked right after the first read lock) or the old
//! root's version change, and restarts.
//!
//! Nodes are never detached: a split keeps the original node and links a
//! new sibling, and a replaced root stays reachable as a child. All nodes
//! are freed when the tree drops.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::AtomicPtr;

use crate::backoff::Backoff;
use crate::index::ConcurrentIndex;
use crate::key::IndexKey;
use crate::lock::{OptResult, Restart};
use crate::node::{InnerNode, LeafNode, NodeHeader, NodeKind};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::trace_log;
use crate::value::Payload;

/// Separator keys bounding a leaf within its immediate parent.
///
/// `lower` is the separator left of the descended child (absent when the
/// leaf is the leftmost child), `upper` the separator right of it (absent
/// when rightmost). The hybrid layer turns these into a hot-range
/// candidate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafBounds<K> {
    pub(crate) lower: Option<K>,
    pub(crate) upper: Option<K>,
}

/// Decision taken by an insert gate just before a leaf commit.
pub(crate) enum Route {
    /// Commit the entry into the leaf.
    Tree,
    /// The entry was absorbed elsewhere; leave the leaf untouched.
    Absorbed,
    /// Gate-side state changed; retry the insert from the top.
    Restart,
}

/// A concurrent B+-tree over fixed-size keys and payloads.
///
/// `CAP` is the per-node entry capacity, derived from the page size; the
/// default fills a 4 KiB page with 8-byte keys and payloads. Leaves hold up
/// to `CAP` entries, inner nodes up to `CAP - 1` separators.
pub struct BTree<K: IndexKey, V: Payload, const CAP: usize = 255> {
    root: AtomicPtr<NodeHeader>,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: all shared node state is reached through atomics or the byte-wise
// access layer, guarded by per-node optimistic locks; the key and payload
// bounds already require Send + Sync.
unsafe impl<K: IndexKey, V: Payload, const CAP: usize> Send for BTree<K, V, CAP> {}
unsafe impl<K: IndexKey, V: Payload, const CAP: usize> Sync for BTree<K, V, CAP> {}

impl<K: IndexKey, V: Payload, const CAP: usize> BTree<K, V, CAP> {
    /// Create a tree holding a single empty leaf as root.
    #[must_use]
    pub fn new() -> Self {
        let root = Box::into_raw(LeafNode::<K, V, CAP>::new()).cast::<NodeHeader>();
        Self {
            root: AtomicPtr::new(root),
            _marker: PhantomData,
        }
    }

    /// Associate `k` with `v`, overwriting any existing payload.
    pub fn insert(&self, k: K, v: V) {
        let mut backoff = Backoff::new();
        let mut gate = |_: Option<&LeafBounds<K>>| Route::Tree;
        loop {
            match self.insert_attempt(k, v, &mut gate) {
                Ok(()) => return,
                Err(Restart) => backoff.wait(),
            }
        }
    }

    /// Return the payload associated with `k`, if any.
    pub fn lookup(&self, k: K) -> Option<V> {
        let mut backoff = Backoff::new();
        loop {
            match self.lookup_attempt(k) {
                Ok(result) => return result,
                Err(Restart) => backoff.wait(),
            }
        }
    }

    /// Copy up to `out.len()` payloads into `out`, starting from the least
    /// key `>= k`, and return how many were written.
    ///
    /// Only the leaf containing that key is read, so fewer payloads than
    /// exist may be returned; callers resume with a key past the last one
    /// received.
    pub fn scan(&self, k: K, out: &mut [V]) -> usize {
        let mut backoff = Backoff::new();
        loop {
            match self.scan_attempt(k, out) {
                Ok(read) => return read,
                Err(Restart) => backoff.wait(),
            }
        }
    }

    /// One gated insert attempt.
    ///
    /// Descends with lock coupling, splitting full nodes eagerly. At a
    /// non-full leaf the `gate` runs before the leaf commit with the
    /// bounds of the leaf in its parent (`None` when the leaf is the
    /// root); it may divert the entry or demand a restart. The plain
    /// insert path passes a gate that always commits.
    pub(crate) fn insert_attempt<G>(&self, k: K, v: V, gate: &mut G) -> OptResult<()>
    where
        G: FnMut(Option<&LeafBounds<K>>) -> Route,
    {
        let root = self.root.load(READ_ORD);
        let mut node = root;
        // SAFETY: nodes reachable from the root stay allocated for the
        // tree's lifetime.
        let mut version = unsafe { (*node).lock.read_lock()? };
        if self.root.load(READ_ORD) != root {
            return Err(Restart);
        }

        let mut parent: *mut InnerNode<K, CAP> = ptr::null_mut();
        let mut parent_version = 0u64;
        let mut bounds: Option<LeafBounds<K>> = None;

        // SAFETY: `kind` is immutable after construction; reading it from
        // a live node is race-free.
        while unsafe { (*node).kind() } == NodeKind::Inner {
            let inner = node.cast::<InnerNode<K, CAP>>();
            // SAFETY: the kind tag says this node is an inner node.
            let inner_ref = unsafe { &*inner };

            if inner_ref.is_full() {
                return self.split_inner_and_restart(node, version, parent, parent_version);
            }

            if !parent.is_null() {
                // SAFETY: parent is a previously visited inner node.
                unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
            }

            parent = inner;
            parent_version = version;

            let count = inner_ref.hdr.count();
            let idx = inner_ref.lower_bound(k);
            bounds = Some(LeafBounds {
                lower: if idx > 0 {
                    Some(inner_ref.key_at(idx - 1))
                } else {
                    None
                },
                upper: if idx < count {
                    Some(inner_ref.key_at(idx))
                } else {
                    None
                },
            });

            node = inner_ref.child(idx);
            inner_ref.hdr.lock.check(version)?;
            // SAFETY: `node` was a child pointer validated by the check
            // above; children of live nodes are live.
            version = unsafe { (*node).lock.read_lock()? };
        }

        let leaf = node.cast::<LeafNode<K, V, CAP>>();
        // SAFETY: the kind tag says this node is a leaf.
        let leaf_ref = unsafe { &*leaf };

        if leaf_ref.is_full() {
            return self.split_leaf_and_restart(node, version, parent, parent_version);
        }

        match gate(bounds.as_ref()) {
            Route::Absorbed => Ok(()),
            Route::Restart => Err(Restart),
            Route::Tree => {
                // SAFETY: leaf and parent pointers are live; the leaf lock
                // is released on every exit path.
                unsafe {
                    (*node).lock.upgrade_to_write_lock(&mut version)?;
                    if !parent.is_null() {
                        if let Err(restart) = (*parent).hdr.lock.read_unlock(parent_version) {
                            (*node).lock.write_unlock();
                            return Err(restart);
                        }
                    }
                }
                leaf_ref.insert(k, v);
                // SAFETY: we hold the leaf write lock.
                unsafe { (*node).lock.write_unlock() };
                Ok(())
            }
        }
    }

    fn lookup_attempt(&self, k: K) -> OptResult<Option<V>> {
        let root = self.root.load(READ_ORD);
        let mut node = root;
        // SAFETY: see `insert_attempt`.
        let mut version = unsafe { (*node).lock.read_lock()? };
        if self.root.load(READ_ORD) != root {
            return Err(Restart);
        }

        let mut parent: *mut InnerNode<K, CAP> = ptr::null_mut();
        let mut parent_version = 0u64;

        // SAFETY: see `insert_attempt`.
        while unsafe { (*node).kind() } == NodeKind::Inner {
            let inner = node.cast::<InnerNode<K, CAP>>();
            // SAFETY: the kind tag says this node is an inner node.
            let inner_ref = unsafe { &*inner };

            if !parent.is_null() {
                // SAFETY: parent is a previously visited inner node.
                unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
            }
            parent = inner;
            parent_version = version;

            node = inner_ref.child(inner_ref.lower_bound(k));
            inner_ref.hdr.lock.check(version)?;
            // SAFETY: child validated by the check above.
            version = unsafe { (*node).lock.read_lock()? };
        }

        // SAFETY: the kind tag says this node is a leaf.
        let leaf_ref = unsafe { &*node.cast::<LeafNode<K, V, CAP>>() };
        let count = leaf_ref.hdr.count();
        let pos = leaf_ref.lower_bound(k);

        let result = if pos < count && leaf_ref.key_at(pos) == k {
            Some(leaf_ref.payload_at(pos))
        } else {
            None
        };

        if !parent.is_null() {
            // SAFETY: parent is a previously visited inner node.
            unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
        }
        // SAFETY: node is the leaf we just read.
        unsafe { (*node).lock.read_unlock(version)? };

        Ok(result)
    }

    fn scan_attempt(&self, k: K, out: &mut [V]) -> OptResult<usize> {
        let root = self.root.load(READ_ORD);
        let mut node = root;
        // SAFETY: see `insert_attempt`.
        let mut version = unsafe { (*node).lock.read_lock()? };
        if self.root.load(READ_ORD) != root {
            return Err(Restart);
        }

        let mut parent: *mut InnerNode<K, CAP> = ptr::null_mut();
        let mut parent_version = 0u64;

        // SAFETY: see `insert_attempt`.
        while unsafe { (*node).kind() } == NodeKind::Inner {
            let inner = node.cast::<InnerNode<K, CAP>>();
            // SAFETY: the kind tag says this node is an inner node.
            let inner_ref = unsafe { &*inner };

            if !parent.is_null() {
                // SAFETY: parent is a previously visited inner node.
                unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
            }
            parent = inner;
            parent_version = version;

            node = inner_ref.child(inner_ref.lower_bound(k));
            inner_ref.hdr.lock.check(version)?;
            // SAFETY: child validated by the check above.
            version = unsafe { (*node).lock.read_lock()? };
        }

        // SAFETY: the kind tag says this node is a leaf.
        let leaf_ref = unsafe { &*node.cast::<LeafNode<K, V, CAP>>() };
        let count = leaf_ref.hdr.count();
        let pos = leaf_ref.lower_bound(k);

        let mut read = 0usize;
        for index in pos..count {
            if read == out.len() {
                break;
            }
            out[read] = leaf_ref.payload_at(index);
            read += 1;
        }

        if !parent.is_null() {
            // SAFETY: parent is a previously visited inner node.
            unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
        }
        // SAFETY: node is the leaf we just read.
        unsafe { (*node).lock.read_unlock(version)? };

        Ok(read)
    }

    // ========================================================================
    //  Eager splits
    // ========================================================================

    /// Write-lock the parent (if any) and the node about to split,
    /// verifying on the way that a rootless node has not gained a parent.
    fn acquire_split_locks(
        &self,
        node: *mut NodeHeader,
        mut version: u64,
        parent: *mut InnerNode<K, CAP>,
        mut parent_version: u64,
    ) -> OptResult<()> {
        // SAFETY: node and parent are live pointers from the descent; each
        // acquired lock is released on every failure path.
        unsafe {
            if !parent.is_null() {
                (*parent)
                    .hdr
                    .lock
                    .upgrade_to_write_lock(&mut parent_version)?;
            }
            if let Err(restart) = (*node).lock.upgrade_to_write_lock(&mut version) {
                if !parent.is_null() {
                    (*parent).hdr.lock.write_unlock();
                }
                return Err(restart);
            }
            if parent.is_null() && node != self.root.load(READ_ORD) {
                // The root split underneath us; this node now has a parent
                // we have not locked.
                (*node).lock.write_unlock();
                return Err(Restart);
            }
        }
        Ok(())
    }

    fn split_inner_and_restart(
        &self,
        node: *mut NodeHeader,
        version: u64,
        parent: *mut InnerNode<K, CAP>,
        parent_version: u64,
    ) -> OptResult<()> {
        self.acquire_split_locks(node, version, parent, parent_version)?;

        // SAFETY: both locks are held; the node was observed as an inner
        // node and kinds never change.
        unsafe {
            let inner = node.cast::<InnerNode<K, CAP>>();
            let (sep, right) = (*inner).split();
            let right = Box::into_raw(right).cast::<NodeHeader>();
            if parent.is_null() {
                self.make_root(sep, node, right);
            } else {
                (*parent).insert_child(sep, right);
            }
            (*node).lock.write_unlock();
            if !parent.is_null() {
                (*parent).hdr.lock.write_unlock();
            }
        }
        Err(Restart)
    }

    fn split_leaf_and_restart(
        &self,
        node: *mut NodeHeader,
        version: u64,
        parent: *mut InnerNode<K, CAP>,
        parent_version: u64,
    ) -> OptResult<()> {
        self.acquire_split_locks(node, version, parent, parent_version)?;

        // SAFETY: both locks are held; the node was observed as a leaf and
        // kinds never change.
        unsafe {
            let leaf = node.cast::<LeafNode<K, V, CAP>>();
            let (sep, right) = (*leaf).split();
            let right = Box::into_raw(right).cast::<NodeHeader>();
            if parent.is_null() {
                self.make_root(sep, node, right);
            } else {
                (*parent).insert_child(sep, right);
            }
            (*node).lock.write_unlock();
            if !parent.is_null() {
                (*parent).hdr.lock.write_unlock();
            }
        }
        Err(Restart)
    }

    /// Install a fresh root with `left` and `right` as children.
    ///
    /// Caller holds the write lock on `left` (the old root), which keeps
    /// concurrent descents from trusting their stale view of it.
    fn make_root(&self, sep: K, left: *mut NodeHeader, right: *mut NodeHeader) {
        trace_log!(?sep, "root split");
        let inner = InnerNode::<K, CAP>::new();
        inner.set_key(0, sep);
        inner.set_child(0, left);
        inner.set_child(1, right);
        inner.hdr.set_count(1);
        self.root
            .store(Box::into_raw(inner).cast::<NodeHeader>(), WRITE_ORD);
    }

    // ========================================================================
    //  Bulk insertion
    // ========================================================================

    /// Descend for a bulk insert: split anything full on the way, then
    /// return the target leaf write-locked together with the tightest
    /// upper separator bounding it from the descent (None when the leaf
    /// is the rightmost in the tree).
    fn bulk_traverse_attempt(&self, k: K) -> OptResult<(*mut LeafNode<K, V, CAP>, Option<K>)> {
        let root = self.root.load(READ_ORD);
        let mut node = root;
        // SAFETY: see `insert_attempt`.
        let mut version = unsafe { (*node).lock.read_lock()? };
        if self.root.load(READ_ORD) != root {
            return Err(Restart);
        }

        let mut parent: *mut InnerNode<K, CAP> = ptr::null_mut();
        let mut parent_version = 0u64;
        let mut upper: Option<K> = None;

        // SAFETY: see `insert_attempt`.
        while unsafe { (*node).kind() } == NodeKind::Inner {
            let inner = node.cast::<InnerNode<K, CAP>>();
            // SAFETY: the kind tag says this node is an inner node.
            let inner_ref = unsafe { &*inner };

            if inner_ref.is_full() {
                self.split_inner_and_restart(node, version, parent, parent_version)?;
                unreachable!("split always restarts");
            }

            if !parent.is_null() {
                // SAFETY: parent is a previously visited inner node.
                unsafe { (*parent).hdr.lock.read_unlock(parent_version)? };
            }
            parent = inner;
            parent_version = version;

            let count = inner_ref.hdr.count();
            let idx = inner_ref.lower_bound(k);
            if idx < count {
                // Tightest bound so far; carried across rightmost-child
                // hops where this level adds no separator.
                upper = Some(inner_ref.key_at(idx));
            }

            node = inner_ref.child(idx);
            inner_ref.hdr.lock.check(version)?;
            // SAFETY: child validated by the check above.
            version = unsafe { (*node).lock.read_lock()? };
        }

        let leaf = node.cast::<LeafNode<K, V, CAP>>();
        // SAFETY: the kind tag says this node is a leaf.
        if unsafe { (*leaf).is_full() } {
            self.split_leaf_and_restart(node, version, parent, parent_version)?;
            unreachable!("split always restarts");
        }

        // SAFETY: leaf and parent are live; the leaf lock is released on
        // the failure path.
        unsafe {
            (*node).lock.upgrade_to_write_lock(&mut version)?;
            if !parent.is_null() {
                if let Err(restart) = (*parent).hdr.lock.read_unlock(parent_version) {
                    (*node).lock.write_unlock();
                    return Err(restart);
                }
            }
        }
        Ok((leaf, upper))
    }

    fn bulk_traverse(&self, k: K) -> (*mut LeafNode<K, V, CAP>, Option<K>) {
        let mut backoff = Backoff::new();
        loop {
            match self.bulk_traverse_attempt(k) {
                Ok(found) => return found,
                Err(Restart) => backoff.wait(),
            }
        }
    }

    /// Install a batch of entries, amortising leaf locking over runs of
    /// neighbouring keys.
    ///
    /// The batch is sorted, then consumed leaf by leaf: each target leaf
    /// is locked once and filled with the longest prefix that fits both
    /// its free capacity and its key range. Prefix keys already present in
    /// the leaf are overwritten in place; the remaining run is merged in
    /// from the high end so every entry settles in its final slot in one
    /// move. When a leaf boundary or full leaf stops the run, one entry
    /// goes through the normal insert path (performing any splits needed)
    /// before bulk consumption resumes.
    ///
    /// Keys within `entries` must be distinct.
    ///
    /// This is the purge path of the hybrid tree, but it is also useful
    /// on its own for preloading a tree from a batch.
    pub fn bulk_insert(&self, mut entries: Vec<(K, V)>) {
        if entries.is_empty() {
            return;
        }
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut next = 0usize;
        while next < entries.len() {
            let (leaf, upper) = self.bulk_traverse(entries[next].0);
            // SAFETY: `bulk_traverse` returned the leaf write-locked.
            let leaf_ref = unsafe { &*leaf };
            let count = leaf_ref.hdr.count();

            // Longest prefix this leaf can take: bounded by its upper
            // separator and its free capacity. Keys it already holds are
            // upserted in place rather than merged twice.
            let mut taken = 0usize;
            let mut fresh: Vec<(K, V)> = Vec::new();
            while next + taken < entries.len() {
                let (k, v) = entries[next + taken];
                if let Some(bound) = upper {
                    if k >= bound {
                        break;
                    }
                }
                let pos = leaf_ref.lower_bound(k);
                if pos < count && leaf_ref.key_at(pos) == k {
                    leaf_ref.set_payload(pos, v);
                    taken += 1;
                    continue;
                }
                if count + fresh.len() == CAP {
                    break;
                }
                fresh.push((k, v));
                taken += 1;
            }

            // Merge the pending run from the high end: whichever of the
            // last unplaced existing entry and the last pending entry is
            // larger claims the current tail slot.
            let total = count + fresh.len();
            let mut slot = total;
            let mut existing = count;
            let mut pending = fresh.len();
            while pending > 0 {
                slot -= 1;
                if existing > 0 && leaf_ref.key_at(existing - 1) > fresh[pending - 1].0 {
                    existing -= 1;
                    leaf_ref.move_entry(existing, slot);
                } else {
                    pending -= 1;
                    let (k, v) = fresh[pending];
                    leaf_ref.set_entry(slot, k, v);
                }
            }
            leaf_ref.hdr.set_count(total);
            // SAFETY: we hold the leaf write lock.
            unsafe { (*leaf).hdr.lock.write_unlock() };

            next += taken;
            if next < entries.len() {
                // The run stopped at a leaf boundary or a full leaf; push
                // one entry through the normal path to open up space.
                let (k, v) = entries[next];
                self.insert(k, v);
                next += 1;
            }
        }
    }

    // ========================================================================
    //  Structure checking
    // ========================================================================

    /// Walk the tree and panic on any ordering violation.
    ///
    /// For tests and debugging only: the walk takes no locks, so callers
    /// must ensure no concurrent operations are running.
    #[doc(hidden)]
    pub fn debug_assert_invariants(&self) {
        // SAFETY: quiescence is the caller's obligation.
        unsafe { check_subtree::<K, V, CAP>(self.root.load(RELAXED), None, None) };
    }
}

/// Verify that every key under `node` lies in `(low, high]` and that keys
/// within each node ascend strictly.
unsafe fn check_subtree<K: IndexKey, V: Payload, const CAP: usize>(
    node: *mut NodeHeader,
    low: Option<K>,
    high: Option<K>,
) {
    let in_range = |k: K| {
        if let Some(low) = low {
            assert!(k > low, "key below its subtree range");
        }
        if let Some(high) = high {
            assert!(k <= high, "key above its subtree range");
        }
    };

    match (*node).kind() {
        NodeKind::Leaf => {
            let leaf = &*node.cast::<LeafNode<K, V, CAP>>();
            let count = leaf.hdr.count();
            for i in 0..count {
                in_range(leaf.key_at(i));
                if i > 0 {
                    assert!(leaf.key_at(i - 1) < leaf.key_at(i), "leaf keys not ascending");
                }
            }
        }
        NodeKind::Inner => {
            let inner = &*node.cast::<InnerNode<K, CAP>>();
            let count = inner.hdr.count();
            assert!(count >= 1, "inner node with no separators");
            for i in 0..count {
                in_range(inner.key_at(i));
                if i > 0 {
                    assert!(
                        inner.key_at(i - 1) < inner.key_at(i),
                        "separators not ascending"
                    );
                }
                let child_low = if i > 0 { Some(inner.key_at(i - 1)) } else { low };
                check_subtree::<K, V, CAP>(inner.child(i), child_low, Some(inner.key_at(i)));
            }
            check_subtree::<K, V, CAP>(inner.child(count), Some(inner.key_at(count - 1)), high);
        }
    }
}

impl<K: IndexKey, V: Payload, const CAP: usize> Default for BTree<K, V, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IndexKey, V: Payload, const CAP: usize> Drop for BTree<K, V, CAP> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no concurrent operations; every
        // node is reachable from the root exactly once.
        unsafe { free_subtree::<K, V, CAP>(self.root.load(RELAXED)) };
    }
}

unsafe fn free_subtree<K: IndexKey, V: Payload, const CAP: usize>(node: *mut NodeHeader) {
    match (*node).kind() {
        NodeKind::Leaf => drop(Box::from_raw(node.cast::<LeafNode<K, V, CAP>>())),
        NodeKind::Inner => {
            let inner = node.cast::<InnerNode<K, CAP>>();
            let count = (*inner).hdr.count();
            for i in 0..=count {
                free_subtree::<K, V, CAP>((*inner).child(i));
            }
            drop(Box::from_raw(inner));
        }
    }
}

impl<K: IndexKey, V: Payload, const CAP: usize> ConcurrentIndex<K, V> for BTree<K, V, CAP> {
    fn insert(&self, key: K, value: V) {
        BTree::insert(self, key, value);
    }

    fn lookup(&self, key: K) -> Option<V> {
        BTree::lookup(self, key)
    }

    fn scan(&self, key: K, out: &mut [V]) -> usize {
        BTree::scan(self, key, out)
    }
}
