//! Optimistic lock for tree nodes.
//!
//! [`OptimisticLock`] packs a writer lock and a version counter into a
//! single 64-bit word. Writers serialise per node through a CAS on the
//! word; readers never write. A reader samples the version before touching
//! node memory and validates it afterwards. If the version moved, whatever
//! was read may be torn and the whole operation restarts.
//!
//! # Word layout
//!
//! - bit 0: obsolete (node was detached and must not be used again)
//! - bit 1: locked (a writer holds the node)
//! - bits 2..64: version, incremented on every write unlock
//!
//! # Restart discipline
//!
//! Every operation that can observe interference returns
//! `Result<_, Restart>`. Callers propagate the signal with `?` up to the
//! public operation, which retries from the top with [`Backoff`] applied
//! between attempts.
//!
//! [`Backoff`]: crate::backoff::Backoff

use std::sync::atomic::{fence, AtomicU64, Ordering};


/// Bit 0: the node has been detached from the tree.
const OBSOLETE_BIT: u64 = 0b01;

/// Bit 1: a writer holds the node.
const LOCKED_BIT: u64 = 0b10;

/// Restart signal for optimistic operations.
///
/// Zero-sized; carries no diagnosis because the only response is to retry
/// from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart;

/// Result alias for operations that may demand a restart.
pub type OptResult<T> = Result<T, Restart>;

/// A versioned per-node lock for optimistic lock coupling.
///
/// Writers acquire the word like a spinlock slot but never spin: a failed
/// CAS is reported as [`Restart`] and the caller retries the whole descent.
/// Readers only load the word, so uncontended traversals stay free of
/// cache-line writes.
pub struct OptimisticLock {
    word: AtomicU64,
}

impl OptimisticLock {
    /// Create an unlocked, non-obsolete lock with version 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0b100),
        }
    }

    #[inline]
    fn is_locked(word: u64) -> bool {
        word & LOCKED_BIT != 0
    }

    #[inline]
    fn is_obsolete(word: u64) -> bool {
        word & OBSOLETE_BIT != 0
    }

    /// Take an optimistic read lock.
    ///
    /// Returns the current version for later validation. If the word is
    /// locked or obsolete, emits a pause hint and signals restart.
    #[inline]
    pub fn read_lock(&self) -> OptResult<u64> {
        let word = self.word.load(Ordering::Acquire);
        if Self::is_locked(word) || Self::is_obsolete(word) {
            std::hint::spin_loop();
            return Err(Restart);
        }
        Ok(word)
    }

    /// Validate that the word still equals `version`.
    ///
    /// The Acquire fence orders all preceding node reads before the
    /// validation load, so a stale read cannot slip past a passed check.
    #[inline]
    pub fn check(&self, version: u64) -> OptResult<()> {
        fence(Ordering::Acquire);
        if self.word.load(Ordering::Relaxed) == version {
            Ok(())
        } else {
            Err(Restart)
        }
    }

    /// Release an optimistic read lock. Alias for [`check`](Self::check).
    #[inline]
    pub fn read_unlock(&self, version: u64) -> OptResult<()> {
        self.check(version)
    }

    /// Upgrade a read lock taken at `version` to the write lock.
    ///
    /// On success `version` is advanced to the locked word so a later
    /// [`write_unlock`](Self::write_unlock) pairs with it.
    #[inline]
    pub fn upgrade_to_write_lock(&self, version: &mut u64) -> OptResult<()> {
        match self.word.compare_exchange(
            *version,
            *version + LOCKED_BIT,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                *version += LOCKED_BIT;
                Ok(())
            }
            Err(_) => {
                std::hint::spin_loop();
                Err(Restart)
            }
        }
    }

    /// Take the write lock from an unlocked state.
    #[inline]
    pub fn write_lock(&self) -> OptResult<()> {
        let mut version = self.read_lock()?;
        self.upgrade_to_write_lock(&mut version)
    }

    /// Release the write lock.
    ///
    /// Adding `0b10` clears the locked bit by carrying into the version,
    /// so every write unlock also bumps the version.
    #[inline]
    pub fn write_unlock(&self) {
        self.word.fetch_add(LOCKED_BIT, Ordering::Release);
    }

    /// Release the write lock and mark the node obsolete.
    ///
    /// Adding `0b11` clears the locked bit, sets the obsolete bit and
    /// bumps the version in one step. Readers that subsequently observe
    /// the word restart instead of trusting the node.
    #[inline]
    pub fn write_unlock_obsolete(&self) {
        self.word.fetch_add(LOCKED_BIT | OBSOLETE_BIT, Ordering::Release);
    }

    /// Raw word, for assertions and diagnostics.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> u64 {
        self.word.load(Ordering::Relaxed)
    }
}

impl Default for OptimisticLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OptimisticLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        f.debug_struct("OptimisticLock")
            .field("version", &(word >> 2))
            .field("locked", &Self::is_locked(word))
            .field("obsolete", &Self::is_obsolete(word))
            .finish()
    }
}
