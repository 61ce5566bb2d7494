//! The per-allocation control header.
//!
//! Every allocation made with the header convention reserves
//! `HEADER_SIZE + requested` contiguous bytes. The [`MemControl`] sits in the
//! first `HEADER_SIZE` bytes and the caller gets a pointer just past it, so
//! the header can always be found again by stepping back `HEADER_SIZE` bytes
//! from a data pointer.
//!
//! [`MemControl`]: struct.MemControl.html

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU8, Ordering};

use static_assertions::const_assert_eq;

use crate::buffer::Buffer;

/// Maximum number of simultaneous holders of one allocation.
pub const MAX_REF_COUNT: u8 = u8::MAX;

/// Header stored immediately before the usable data of an allocation.
///
/// We use C representation and align to 16 bytes, so that the data following
/// the header keeps the alignment of the allocation itself.
#[repr(C, align(16))]
pub struct MemControl {
    // Set once when the allocation is made, never written afterward
    native_handle: *mut c_void,
    rc: AtomicU8,
}

/// Size of the [`MemControl`](struct.MemControl.html) header, in bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<MemControl>();
const_assert_eq!(HEADER_SIZE, 16);

// The native handle is never mutated after creation and the count is atomic.
unsafe impl Send for MemControl {}
unsafe impl Sync for MemControl {}

/// Returned by [`MemControl::retain`](struct.MemControl.html#method.retain)
/// when the allocation already has [`MAX_REF_COUNT`] holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCountOverflow;

impl fmt::Display for RefCountOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference count would exceed {}", MAX_REF_COUNT)
    }
}

impl fmt::Debug for MemControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemControl")
            .field("native_handle", &self.native_handle)
            .field("rc", &self.ref_count())
            .finish()
    }
}

impl MemControl {
    /// A fresh header with a single holder.
    pub const fn new(native_handle: *mut c_void) -> Self {
        MemControl {
            native_handle,
            rc: AtomicU8::new(1),
        }
    }

    /// Write a fresh header at `at` and return a pointer to it.
    ///
    /// # Safety
    ///
    /// `at` must be 16-byte aligned and point to at least `HEADER_SIZE`
    /// writable bytes that nothing else is using.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn write(at: NonNull<u8>, native_handle: *mut c_void) -> NonNull<MemControl> {
        let header: NonNull<MemControl> = at.cast();
        core::ptr::write(header.as_ptr(), MemControl::new(native_handle));
        header
    }

    /// The header belonging to a data pointer.
    ///
    /// This is only pointer arithmetic. The result is meaningful only if
    /// `raw_ptr` came from an allocation using the header convention.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn header_of(raw_ptr: *mut u8) -> *mut MemControl {
        raw_ptr.wrapping_sub(HEADER_SIZE) as *mut MemControl
    }

    /// The header of a valid buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid and its allocation still live.
    pub unsafe fn of_buffer<'a>(buffer: Buffer) -> &'a MemControl {
        debug_assert!(buffer.is_valid(), "MemControl::of_buffer on a null buffer");
        &*MemControl::header_of(buffer.raw_ptr())
    }

    /// Usable bytes of a buffer: its total size less the header.
    pub fn usable_size(buffer: Buffer) -> usize {
        buffer.size().saturating_sub(HEADER_SIZE)
    }

    /// Usable bytes behind a data pointer, found through its header's native
    /// handle.
    ///
    /// # Safety
    ///
    /// `raw_ptr` must come from a live allocation using the header
    /// convention.
    pub unsafe fn usable_size_raw(raw_ptr: *mut u8) -> usize {
        let header = &*MemControl::header_of(raw_ptr);
        MemControl::usable_size(Buffer::from_raw(header.native_handle))
    }

    pub fn native_handle(&self) -> *mut c_void {
        self.native_handle
    }

    pub fn ref_count(&self) -> u8 {
        self.rc.load(Ordering::Acquire)
    }

    /// Add a holder, returning the new count.
    ///
    /// The count never goes past [`MAX_REF_COUNT`]; at the ceiling this
    /// fails and leaves the count unchanged.
    pub fn retain(&self) -> Result<u8, RefCountOverflow> {
        // Holders only ever retain while they keep the allocation alive, so
        // Relaxed is enough here; release synchronizes the free.
        self.rc
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |rc| {
                debug_assert!(rc > 0, "retain on a released allocation");
                rc.checked_add(1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| RefCountOverflow)
    }

    /// Drop a holder, returning the remaining count. Zero means the caller
    /// was the last holder and may release the allocation.
    pub fn release(&self) -> u8 {
        let prev = self.rc.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "release on a released allocation");
        if prev == 1 {
            fence(Ordering::Acquire);
        }
        prev.wrapping_sub(1)
    }
}
