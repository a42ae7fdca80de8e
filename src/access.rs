//! Byte-wise atomic access to node entry arrays.
//!
//! Optimistic readers race with writers on leaf and inner entry arrays by
//! design; the version check afterwards discards anything torn. To keep
//! those races defined, every access to shared entry memory goes through
//! relaxed per-byte atomics instead of plain loads and stores. The
//! [`bytemuck::Pod`] bound guarantees that a torn read still assembles
//! into a valid (if meaningless) value, which validation then rejects.
//!
//! Synchronisation is carried entirely by the node's lock word: writers
//! publish with a Release unlock, readers validate behind an Acquire
//! fence. The copies here can therefore all stay relaxed.

use std::mem::{size_of, MaybeUninit};
use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

use bytemuck::Pod;

/// Copy `len` bytes between potentially contended locations, one relaxed
/// atomic byte at a time. `REVERSE` walks from the high end so overlapping
/// upward moves do not clobber their own source.
///
/// # Safety
///
/// `src` must be valid for reads and `dst` for writes of `len` bytes. All
/// concurrent accesses to either region must also go through this module.
unsafe fn atomic_memcpy<const REVERSE: bool>(src: *const u8, dst: *mut u8, len: usize) {
    let src = src.cast::<AtomicU8>();
    let dst = dst.cast::<AtomicU8>();
    if REVERSE {
        for i in (0..len).rev() {
            (*dst.add(i)).store((*src.add(i)).load(Relaxed), Relaxed);
        }
    } else {
        for i in 0..len {
            (*dst.add(i)).store((*src.add(i)).load(Relaxed), Relaxed);
        }
    }
}

/// Read one element from a shared entry slot.
///
/// # Safety
///
/// `src` must point to a valid `T` inside a node's entry array.
#[inline]
pub(crate) unsafe fn load<T: Pod>(src: *const T) -> T {
    let mut out = MaybeUninit::<T>::uninit();
    atomic_memcpy::<false>(src.cast(), out.as_mut_ptr().cast(), size_of::<T>());
    // SAFETY: every byte was written above and any bit pattern is a valid
    // T because T: Pod.
    out.assume_init()
}

/// Write one element into a shared entry slot.
///
/// # Safety
///
/// `dst` must point into a node's entry array and the caller must hold
/// that node's write lock.
#[inline]
pub(crate) unsafe fn store<T: Pod>(dst: *mut T, value: T) {
    atomic_memcpy::<false>((&value as *const T).cast(), dst.cast(), size_of::<T>());
}

/// Shift `count` elements starting at `base.add(from)` one slot upward,
/// opening a hole at index `from`. Walks downward so the overlap is safe.
///
/// # Safety
///
/// Indices `from..from + count + 1` must be in bounds of the array at
/// `base` and the caller must hold the owning node's write lock.
pub(crate) unsafe fn shift_up<T: Pod>(base: *mut T, from: usize, count: usize) {
    if count == 0 {
        return;
    }
    atomic_memcpy::<true>(
        base.add(from).cast(),
        base.add(from + 1).cast(),
        count * size_of::<T>(),
    );
}

/// Copy `count` elements between disjoint entry arrays.
///
/// # Safety
///
/// Both ranges must be in bounds and non-overlapping; the caller must hold
/// the write lock of the destination node (and of the source node if it is
/// shared).
pub(crate) unsafe fn copy_nonoverlapping<T: Pod>(src: *const T, dst: *mut T, count: usize) {
    atomic_memcpy::<false>(src.cast(), dst.cast(), count * size_of::<T>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_round_trip() {
        let mut slot = 0u64;
        unsafe {
            store(&mut slot, 0xDEAD_BEEF_u64);
            assert_eq!(load(&slot), 0xDEAD_BEEF_u64);
        }
    }

    #[test]
    fn shift_up_opens_a_hole() {
        let mut arr = [10u64, 20, 30, 40, 0];
        unsafe {
            shift_up(arr.as_mut_ptr(), 1, 3);
            store(arr.as_mut_ptr().add(1), 15u64);
        }
        assert_eq!(arr, [10, 15, 20, 30, 40]);
    }

    #[test]
    fn shift_up_of_nothing_is_a_no_op() {
        let mut arr = [1u32, 2];
        unsafe { shift_up(arr.as_mut_ptr(), 1, 0) };
        assert_eq!(arr, [1, 2]);
    }

    #[test]
    fn copy_between_arrays() {
        let src = [1u16, 2, 3, 4];
        let mut dst = [0u16; 4];
        unsafe { copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), 4) };
        assert_eq!(src, dst);
    }
}
