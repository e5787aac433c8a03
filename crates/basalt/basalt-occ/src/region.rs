//! Validated views over a caller-owned shared buffer.
//!
//! A [`Region`] never owns its memory. Whoever mapped or allocated the bytes
//! keeps them alive; the region only hands out typed handles after checking
//! bounds and alignment once, so the hot-path operations on those handles
//! carry no checks at all.

use crate::atomic::AtomicCell;
use crate::control_block::{CACHE_LINE, CONTROL_BLOCK_SIZE, ControlBlock};
use crate::doorbell::{Doorbell, StopSignal};
use crate::versioned::{VersionCounter, VersionedBlock, VersionedSlot};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("{len} bytes at offset {offset} do not fit in a {region_len}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("offset {offset} is not {align}-byte aligned")]
    Misaligned { offset: usize, align: usize },

    #[error("payload of {available} bytes cannot hold a {needed}-byte value")]
    PayloadTooSmall { needed: usize, available: usize },

    #[error("payload at {payload_offset} overlaps the control block at {block_offset}")]
    Overlapping {
        block_offset: usize,
        payload_offset: usize,
    },
}

/// Values that may be stored in and copied out of a shared payload.
///
/// Every bit pattern is a valid value, there is no padding and no interior
/// mutability, so a torn or foreign copy is still a value of the type. It is
/// implemented for every type that derives the three `zerocopy` traits.
pub trait Plain: FromBytes + IntoBytes + Immutable + Copy {}

impl<T: FromBytes + IntoBytes + Immutable + Copy> Plain for T {}

/// A shared buffer, as seen by one participant.
#[derive(Clone, Copy)]
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _pd: PhantomData<&'a UnsafeCell<[u8]>>,
}

// SAFETY: a Region only hands out atomics and protocol-guarded payload views;
// it is meant to be used from many threads at once.
unsafe impl Send for Region<'_> {}
unsafe impl Sync for Region<'_> {}

impl<'a> Region<'a> {
    /// Borrows an in-process buffer as a region.
    pub fn from_mut_slice(buf: &'a mut [u8]) -> Self {
        let len = buf.len();
        Self {
            base: NonNull::from(buf).cast(),
            len,
            _pd: PhantomData,
        }
    }

    /// # Safety
    /// `base` must be non-null and valid for reads and writes of `len` bytes
    /// for `'a`, and every other user of those bytes must follow the same
    /// atomic protocols.
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Self {
            // SAFETY: non-null is part of the caller's contract.
            base: unsafe { NonNull::new_unchecked(base) },
            len,
            _pd: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn checked_ptr(&self, offset: usize, len: usize, align: usize) -> Result<*mut u8, RegionError> {
        let end = offset.checked_add(len);
        if end.is_none_or(|end| end > self.len) {
            return Err(RegionError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            });
        }
        let addr = self.base.as_ptr() as usize + offset;
        if addr % align != 0 {
            return Err(RegionError::Misaligned { offset, align });
        }
        // SAFETY: offset + len is within the region.
        Ok(unsafe { self.base.as_ptr().add(offset) })
    }

    /// A 64-bit atomic cell at `offset` (8-byte aligned).
    pub fn cell(&self, offset: usize) -> Result<AtomicCell<'a>, RegionError> {
        let ptr = self.checked_ptr(offset, size_of::<i64>(), size_of::<i64>())?;
        // SAFETY: in bounds, aligned, and valid for 'a.
        Ok(unsafe { AtomicCell::from_ptr(ptr as *mut i64) })
    }

    /// The control block at `offset` (cache-line aligned).
    pub fn control_block(&self, offset: usize) -> Result<&'a ControlBlock, RegionError> {
        let ptr = self.checked_ptr(offset, CONTROL_BLOCK_SIZE, CACHE_LINE)?;
        // SAFETY: in bounds and aligned; every bit pattern is a valid
        // ControlBlock and all mutable fields are atomics.
        Ok(unsafe { &*(ptr as *const ControlBlock) })
    }

    /// The version counter of the control block at `block_offset`.
    pub fn counter(&self, block_offset: usize) -> Result<VersionCounter<'a>, RegionError> {
        Ok(VersionCounter::new(self.control_block(block_offset)?))
    }

    /// The control block at `block_offset` as the guard of `payload_len`
    /// bytes at `payload_offset`.
    ///
    /// # Safety
    /// For as long as the returned block (or anything derived from it) is in
    /// use, the payload bytes must be written only through sessions of a
    /// block at `block_offset` of this region, and must not overlap any cell,
    /// control block or doorbell that is in use.
    pub unsafe fn versioned(
        &self,
        block_offset: usize,
        payload_offset: usize,
        payload_len: usize,
    ) -> Result<VersionedBlock<'a>, RegionError> {
        let block = self.control_block(block_offset)?;
        let payload = self.payload(payload_offset, payload_len)?;
        let block_end = block_offset + CONTROL_BLOCK_SIZE;
        let payload_end = payload_offset + payload_len;
        if payload_len > 0 && payload_offset < block_end && block_offset < payload_end {
            return Err(RegionError::Overlapping {
                block_offset,
                payload_offset,
            });
        }
        // SAFETY: forwarded to the caller.
        Ok(unsafe { VersionedBlock::new(block, payload) })
    }

    pub fn doorbell(&self, offset: usize) -> Result<Doorbell<'a>, RegionError> {
        Ok(Doorbell::new(self.cell(offset)?))
    }

    pub fn stop_signal(&self, offset: usize) -> Result<StopSignal<'a>, RegionError> {
        Ok(StopSignal::new(self.doorbell(offset)?))
    }

    /// `len` payload bytes at `offset`. No alignment requirement.
    pub fn payload(&self, offset: usize, len: usize) -> Result<Payload<'a>, RegionError> {
        let ptr = self.checked_ptr(offset, len, 1)?;
        Ok(Payload {
            // SAFETY: derived from the non-null base.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            _pd: PhantomData,
        })
    }

    /// A typed versioned slot: the control block at `block_offset` guarding a
    /// `T` stored at `payload_offset`.
    ///
    /// Only [`Plain`] types fit in a slot:
    ///
    /// ```compile_fail
    /// use basalt_occ::HeapRegion;
    /// let heap = HeapRegion::new_zeroed(128);
    /// let _ = unsafe { heap.region().slot::<&'static u64>(0, 64) };
    /// ```
    ///
    /// ```compile_fail
    /// use basalt_occ::HeapRegion;
    /// let heap = HeapRegion::new_zeroed(128);
    /// let _ = unsafe { heap.region().slot::<bool>(0, 64) };
    /// ```
    ///
    /// # Safety
    /// Same contract as [`versioned`](Self::versioned) for the
    /// `size_of::<T>()` bytes at `payload_offset`.
    pub unsafe fn slot<T: Plain>(
        &self,
        block_offset: usize,
        payload_offset: usize,
    ) -> Result<VersionedSlot<'a, T>, RegionError> {
        // SAFETY: forwarded to the caller.
        let block = unsafe { self.versioned(block_offset, payload_offset, size_of::<T>()) }?;
        VersionedSlot::new(block)
    }
}

impl std::fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// Protected payload bytes inside a region.
///
/// Reads are always allowed but may be torn; validate them with the control
/// block's version. Writes are `unsafe` on their own and safe through a
/// [`WriteSession`](crate::WriteSession), which proves the writer holds the
/// claim.
#[derive(Clone, Copy)]
pub struct Payload<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _pd: PhantomData<&'a UnsafeCell<[u8]>>,
}

// SAFETY: same reasoning as Region.
unsafe impl Send for Payload<'_> {}
unsafe impl Sync for Payload<'_> {}

impl<'a> Payload<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    fn check(&self, at: usize, n: usize) {
        assert!(
            at.checked_add(n).is_some_and(|end| end <= self.len),
            "payload access {at}..{} out of range (len {})",
            at.saturating_add(n),
            self.len
        );
    }

    /// Copies `out.len()` bytes starting at `at` into `out`.
    ///
    /// # Panics
    /// Panics if the range is outside the payload.
    #[inline]
    pub fn read_bytes(&self, at: usize, out: &mut [u8]) {
        self.check(at, out.len());
        // SAFETY: range checked; concurrent writers are detected by the
        // version re-check the caller performs.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(at), out.as_mut_ptr(), out.len()) };
    }

    /// Reads a `T` starting at `at`, unaligned.
    ///
    /// # Panics
    /// Panics if the range is outside the payload.
    #[inline]
    pub fn read_value<T: FromBytes + Copy>(&self, at: usize) -> T {
        self.check(at, size_of::<T>());
        // SAFETY: range checked and every bit pattern is a valid T; see
        // read_bytes for concurrent writers.
        unsafe { ptr::read_unaligned(self.ptr.as_ptr().add(at) as *const T) }
    }

    /// # Safety
    /// The caller must be the only writer of these bytes for the duration of
    /// the call (normally: it holds the odd version of the guarding block).
    ///
    /// # Panics
    /// Panics if the range is outside the payload.
    #[inline]
    pub unsafe fn write_bytes(&self, at: usize, bytes: &[u8]) {
        self.check(at, bytes.len());
        // SAFETY: range checked; exclusivity upheld by the caller.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(at), bytes.len()) };
    }

    /// # Safety
    /// Same contract as [`write_bytes`](Self::write_bytes).
    #[inline]
    pub unsafe fn write_value<T: IntoBytes + Immutable>(&self, at: usize, value: T) {
        // SAFETY: exclusivity upheld by the caller.
        unsafe { self.write_bytes(at, value.as_bytes()) }
    }
}

impl std::fmt::Debug for Payload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A zeroed, cache-line-aligned heap buffer that can back a [`Region`].
///
/// For threads within one process; use a file mapping to share with other
/// processes.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is only reachable through Region, which is Sync.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// # Panics
    /// Panics if `len` is zero or too large for an allocation.
    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region must not be empty");
        let layout = match Layout::from_size_align(len, CACHE_LINE) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid region size {len}: {e}"),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| handle_alloc_error(layout));
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region<'_> {
        // SAFETY: we own the allocation for as long as the borrow lasts.
        unsafe { Region::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
