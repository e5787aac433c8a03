//! The three hardware operations everything else in this crate is built from.
//!
//! | operation            | ordering | used for                               |
//! |----------------------|----------|----------------------------------------|
//! | [`compare_and_swap`] | SeqCst   | version transitions, advisory lock     |
//! | [`store`]            | Release  | ringing doorbells, writer identity     |
//! | [`load`]             | Acquire  | polling doorbells, reading the version |
//!
//! The free functions take a raw address and are the boundary a binding layer
//! talks to. Inside the crate the same operations are reached through
//! [`AtomicCell`], a handle whose address was checked once when a
//! [`Region`](crate::Region) produced it.

use std::sync::atomic::{AtomicI64, Ordering};

/// Atomically replaces the 64-bit cell at `addr` with `desired` if it holds
/// `expected`. Returns whether the swap happened.
///
/// Sequentially consistent on both success and failure, so it composes with
/// the release stores and acquire loads below.
///
/// # Safety
/// `addr` must be non-null, 8-byte aligned and point into live memory that is
/// only ever accessed atomically for the duration of the call. None of this
/// is checked.
#[inline(always)]
pub unsafe fn compare_and_swap(addr: *mut i64, expected: i64, desired: i64) -> bool {
    // SAFETY: upheld by the caller.
    let cell = unsafe { AtomicI64::from_ptr(addr) };
    cell.compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Atomically writes `value` with release ordering.
///
/// Every write the calling thread made before this call is visible to a
/// thread whose acquire [`load`] of the same cell observes `value`.
///
/// # Safety
/// Same contract as [`compare_and_swap`].
#[inline(always)]
pub unsafe fn store(addr: *mut i64, value: i64) {
    // SAFETY: upheld by the caller.
    let cell = unsafe { AtomicI64::from_ptr(addr) };
    cell.store(value, Ordering::Release);
}

/// Atomically reads the cell with acquire ordering.
///
/// # Safety
/// Same contract as [`compare_and_swap`].
#[inline(always)]
pub unsafe fn load(addr: *mut i64) -> i64 {
    // SAFETY: upheld by the caller.
    let cell = unsafe { AtomicI64::from_ptr(addr) };
    cell.load(Ordering::Acquire)
}

/// A validated handle to one 64-bit cell of a shared region.
///
/// Cheap to copy; the lifetime ties it to the region (or control block) it
/// was carved from.
#[derive(Clone, Copy)]
pub struct AtomicCell<'r> {
    cell: &'r AtomicI64,
}

impl<'r> AtomicCell<'r> {
    /// Wraps an atomic that already lives somewhere valid for `'r`.
    #[inline(always)]
    pub(crate) fn from_atomic(cell: &'r AtomicI64) -> Self {
        Self { cell }
    }

    /// # Safety
    /// `ptr` must be 8-byte aligned, valid for `'r` and only accessed
    /// atomically while the handle exists.
    #[inline(always)]
    pub(crate) unsafe fn from_ptr(ptr: *mut i64) -> Self {
        // SAFETY: upheld by the caller.
        Self {
            cell: unsafe { AtomicI64::from_ptr(ptr) },
        }
    }

    /// See [`compare_and_swap`].
    #[inline(always)]
    pub fn compare_and_swap(&self, expected: i64, desired: i64) -> bool {
        // SAFETY: the handle was validated at construction.
        unsafe { compare_and_swap(self.cell.as_ptr(), expected, desired) }
    }

    /// Like [`compare_and_swap`](Self::compare_and_swap) but reports the
    /// value found in the cell when the swap does not happen.
    #[inline(always)]
    pub fn compare_exchange(&self, expected: i64, desired: i64) -> Result<i64, i64> {
        self.cell
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// See [`store`].
    #[inline(always)]
    pub fn store(&self, value: i64) {
        // SAFETY: the handle was validated at construction.
        unsafe { store(self.cell.as_ptr(), value) }
    }

    /// See [`load`].
    #[inline(always)]
    pub fn load(&self) -> i64 {
        // SAFETY: the handle was validated at construction.
        unsafe { load(self.cell.as_ptr()) }
    }

    /// The address this handle targets, for handing to a binding layer.
    #[inline]
    pub fn as_ptr(&self) -> *mut i64 {
        self.cell.as_ptr()
    }
}

impl std::fmt::Debug for AtomicCell<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicCell")
            .field("addr", &self.cell.as_ptr())
            .field("value", &self.load())
            .finish()
    }
}
