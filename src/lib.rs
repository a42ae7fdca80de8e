//! # hybrid-btree
//!
//! A concurrent, in-memory ordered map built on a B+-tree with optimistic
//! lock coupling, tuned for workloads where contention gravitates to a few
//! hot leaves (sequential inserts, skewed key ranges).
//!
//! Three variants share one contract ([`ConcurrentIndex`]):
//!
//! - [`BTree`]: the plain optimistic-lock-coupled B+-tree. Writers hold at
//!   most two node locks while descending; readers hold none and validate
//!   versions instead.
//! - [`HybridTree`]: the B+-tree plus a policy/cache pair. A fixed-size
//!   working set tracks hot key ranges by recency; writes to a hot range
//!   are absorbed by a concurrent cache and bulk-inserted back into the
//!   tree when the range is evicted. Point lookups see cached keys; range
//!   scans do not.
//! - [`ByteReorderTree`]: the B+-tree behind a self-inverse key
//!   permutation (extremal-byte swap) that scatters sequential keys across
//!   leaves, at the price of meaningful scan order.
//!
//! ## Configuration
//!
//! Nodes are sized against [`PAGE_SIZE`] (4 KiB). The per-node entry
//! capacity is the `CAP` const generic parameter on each tree; the default
//! of 255 fills a page with 8-byte keys and payloads, and a compile-time
//! assertion rejects capacities that would overflow the page. The hybrid
//! tree's `N` parameter bounds how many hot ranges its working set tracks.
//!
//! ## Keys and payloads
//!
//! Keys and payloads are fixed-size, trivially copyable scalars (the
//! [`bytemuck::Pod`] bound makes racy-then-validated reads well defined).
//! Keys are totally ordered; payloads are opaque and returned by copy.
//!
//! ```
//! use hybrid_btree::HybridTree;
//!
//! let index: HybridTree<u64, u64> = HybridTree::new();
//! index.insert(7, 42);
//! assert_eq!(index.lookup(7), Some(42));
//! ```

mod access;
mod backoff;
mod tracing_helpers;

pub mod hc;
pub mod hybrid;
pub mod index;
pub mod key;
pub mod lock;
pub mod node;
pub mod ordering;
pub mod reorder;
pub mod tree;
pub mod value;
pub mod ws;

pub use hc::HotCache;
pub use hybrid::HybridTree;
pub use index::ConcurrentIndex;
pub use key::{IndexKey, RangeKey, ReorderBytes};
pub use lock::{OptimisticLock, Restart};
pub use node::{DEFAULT_FAN_OUT, PAGE_SIZE};
pub use reorder::ByteReorderTree;
pub use tree::BTree;
pub use value::Payload;
pub use ws::WorkingSet;
