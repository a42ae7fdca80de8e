//! The contract shared by every tree variant.

/// A thread-safe ordered map over fixed-size keys and payloads.
///
/// All implementations accept arbitrary concurrent callers. Tests and
/// benchmarks stay generic over this trait so every variant runs the same
/// workloads.
pub trait ConcurrentIndex<K, V> {
    /// Associate `key` with `value`; an existing association is
    /// overwritten.
    fn insert(&self, key: K, value: V);

    /// Return the payload associated with `key`, or `None` if absent.
    fn lookup(&self, key: K) -> Option<V>;

    /// Copy up to `out.len()` payloads into `out`, starting from the
    /// least key `>= key`, and return how many were written.
    ///
    /// Implementations may return fewer payloads than exist; callers loop
    /// with a resumed key until nothing more is read.
    fn scan(&self, key: K, out: &mut [V]) -> usize;
}
