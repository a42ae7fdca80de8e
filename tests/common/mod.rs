//! Shared test utilities: tracing setup and workload generators.

#![allow(dead_code)]

use std::sync::Once;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

static INIT: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic payload for a key, so threads replaying the same data
/// upsert identical values.
pub fn value_for(k: u64) -> u64 {
    k.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// `n` unique keys in random order, each paired with its payload.
pub fn gen_data(n: u64, seed: u64) -> Vec<(u64, u64)> {
    let mut keys: Vec<u64> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    keys.shuffle(&mut rng);
    keys.into_iter().map(|k| (k, value_for(k))).collect()
}

/// `(0, v(0)) .. (n - 1, v(n - 1))` in ascending key order.
pub fn gen_data_seq(n: u64) -> Vec<(u64, u64)> {
    (0..n).map(|k| (k, value_for(k))).collect()
}
