//! Property-based tests for the tree variants.
//!
//! Differential testing against `std::collections::BTreeMap` as the
//! oracle: any interleaving of inserts, upserts and lookups must agree
//! with the model, for every variant.

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;

use hybrid_btree::{BTree, ByteReorderTree, ConcurrentIndex, HybridTree, ReorderBytes};

/// Operations for random single-threaded testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Lookup(u64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    // Keys from a small domain so upserts and collisions actually happen.
    let key = 0u64..512;
    prop::collection::vec(
        prop_oneof![
            3 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => key.prop_map(Op::Lookup),
        ],
        0..=max_ops,
    )
}

fn check_against_model<I: ConcurrentIndex<u64, u64>>(index: &I, ops: &[Op]) {
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    for op in ops {
        match op {
            Op::Insert(k, v) => {
                index.insert(*k, *v);
                model.insert(*k, *v);
            }
            Op::Lookup(k) => {
                assert_eq!(index.lookup(*k), model.get(k).copied(), "key {k} diverged");
            }
        }
    }
    // Final sweep: every model entry must be visible, every absent key
    // absent.
    for (k, v) in &model {
        assert_eq!(index.lookup(*k), Some(*v));
    }
    for k in 512..600u64 {
        assert_eq!(index.lookup(k), None);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn olc_tree_matches_model(ops in operations(400)) {
        let tree: BTree<u64, u64, 16> = BTree::new();
        check_against_model(&tree, &ops);
        tree.debug_assert_invariants();
    }

    #[test]
    fn hybrid_tree_matches_model(ops in operations(400)) {
        let tree: HybridTree<u64, u64, 4, 16> = HybridTree::new();
        check_against_model(&tree, &ops);
    }

    #[test]
    fn reorder_tree_matches_model(ops in operations(400)) {
        let tree: ByteReorderTree<u64, u64, 16> = ByteReorderTree::new();
        check_against_model(&tree, &ops);
    }

    /// A scan starting anywhere returns a prefix of the model's ordered
    /// tail beginning at that key.
    #[test]
    fn scan_returns_an_ordered_prefix(
        keys in prop::collection::btree_set(0u64..2_000, 1..300),
        start in 0u64..2_100,
    ) {
        let tree: BTree<u64, u64, 16> = BTree::new();
        for k in &keys {
            tree.insert(*k, k.wrapping_mul(3));
        }

        let mut out = [0u64; 32];
        let read = tree.scan(start, &mut out);

        let expected: Vec<u64> = keys
            .iter()
            .filter(|k| **k >= start)
            .take(read)
            .map(|k| k.wrapping_mul(3))
            .collect();
        prop_assert_eq!(&out[..read], expected.as_slice());
    }

    /// The byte permutation is injective and self-inverse for all keys.
    #[test]
    fn reorder_permutation_is_bijective(a: u64, b: u64) {
        prop_assert_eq!(a.reorder().reorder(), a);
        if a != b {
            prop_assert_ne!(a.reorder(), b.reorder());
        }
    }

    /// Bulk insertion agrees with one-by-one insertion, including when
    /// some keys are already present.
    #[test]
    fn bulk_insert_matches_model(
        preload in prop::collection::btree_map(0u64..1_000, any::<u64>(), 0..200),
        batch in prop::collection::btree_map(0u64..1_000, any::<u64>(), 0..200),
    ) {
        let tree: BTree<u64, u64, 16> = BTree::new();
        let mut model = BTreeMap::new();

        for (k, v) in &preload {
            tree.insert(*k, *v);
            model.insert(*k, *v);
        }
        tree.bulk_insert(batch.iter().map(|(k, v)| (*k, *v)).collect());
        model.extend(batch.iter().map(|(k, v)| (*k, *v)));

        tree.debug_assert_invariants();
        for (k, v) in &model {
            prop_assert_eq!(tree.lookup(*k), Some(*v));
        }
    }
}
