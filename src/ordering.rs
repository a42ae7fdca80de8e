//! Standard memory orderings for concurrent node access.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields during optimistic traversal.
/// Pairs with a writer's Release publication.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields from under a write lock.
/// Pairs with a reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for accesses that are already serialised by a node's write
/// lock or that are validated afterwards against the lock version.
pub const RELAXED: Ordering = Ordering::Relaxed;
