//! Payload capability trait.

use std::fmt::Debug;

use bytemuck::Pod;

/// An opaque fixed-size value stored alongside a key.
///
/// Payloads are copied in and out of nodes; the tree never hands out
/// references into node memory. The [`Pod`] bound keeps racy optimistic
/// reads of payload slots defined, mirroring [`IndexKey`].
///
/// [`IndexKey`]: crate::key::IndexKey
pub trait Payload: Pod + Send + Sync + Debug + 'static {}

impl<T: Pod + Send + Sync + Debug + 'static> Payload for T {}
