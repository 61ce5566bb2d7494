use core::ffi::c_void;
use core::ptr::null_mut;

use static_assertions::const_assert_eq;

use crate::control::{MemControl, HEADER_SIZE};

/// The native buffer object a [`MemControl`](struct.MemControl.html) header
/// points back to.
///
/// Host allocations place it directly in front of their header; a device
/// backend would keep it wherever its native objects live, as long as
/// `contents` is a CPU-visible pointer to the header.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct NativeBuffer {
    // Total bytes of the native region, header included
    size: usize,
    // Start of the native region, where the MemControl is stored
    contents: *mut u8,
}

const_assert_eq!(core::mem::size_of::<NativeBuffer>(), 16);

impl NativeBuffer {
    pub const fn new(contents: *mut u8, size: usize) -> Self {
        NativeBuffer { size, contents }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contents(&self) -> *mut u8 {
        self.contents
    }
}

/// An opaque, copyable handle to one allocation.
///
/// A `Buffer` wraps a pointer to a [`NativeBuffer`](struct.NativeBuffer.html).
/// It does not own the allocation: copies alias the same memory, and the
/// allocator that produced it decides when that memory goes away.
///
/// The null buffer is the sentinel returned when an allocation fails; check
/// it with [`is_valid`](#method.is_valid).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Buffer {
    ptr: *mut c_void,
}

// A Buffer is only a handle. Access to the memory behind it is governed by
// the allocator contract, not by which thread holds the handle.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::null()
    }
}

impl Buffer {
    /// The invalid sentinel buffer.
    pub const fn null() -> Self {
        Buffer { ptr: null_mut() }
    }

    /// Wrap a native handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live `NativeBuffer` whose `contents`
    /// hold a `MemControl` header.
    pub const unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Buffer { ptr }
    }

    /// Recover the buffer owning a data pointer previously returned by
    /// [`raw_ptr`](#method.raw_ptr).
    ///
    /// # Safety
    ///
    /// `raw_ptr` must come from a live allocation using the header
    /// convention.
    pub unsafe fn from_data(raw_ptr: *mut u8) -> Self {
        let header = MemControl::header_of(raw_ptr);
        Buffer::from_raw((*header).native_handle())
    }

    pub fn is_valid(&self) -> bool {
        !self.ptr.is_null()
    }

    pub fn ptr(&self) -> *const c_void {
        self.ptr
    }

    pub fn ptr_mut(&mut self) -> *mut c_void {
        self.ptr
    }

    fn native(&self) -> Option<&NativeBuffer> {
        // Valid handles point to a live NativeBuffer by construction.
        unsafe { (self.ptr as *const NativeBuffer).as_ref() }
    }

    /// The start of the usable data, just past the header. Null for the
    /// sentinel.
    pub fn raw_ptr(&self) -> *mut u8 {
        match self.native() {
            Some(native) => native.contents().wrapping_add(HEADER_SIZE),
            None => null_mut(),
        }
    }

    /// Total size of the native region, header included. Zero for the
    /// sentinel.
    pub fn size(&self) -> usize {
        self.native().map(NativeBuffer::size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn test_null_buffer() {
        let buffer = Buffer::null();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.raw_ptr().is_null());
        assert_eq!(buffer, Buffer::default());
    }

    #[test]
    fn test_handle_accessors() {
        #[repr(C, align(16))]
        struct Region {
            native: NativeBuffer,
            body: [u8; 64],
        }

        let mut region = Region {
            native: NativeBuffer::new(null_mut(), 64),
            body: [0; 64],
        };
        region.native.contents = region.body.as_mut_ptr();
        let native: *mut NativeBuffer = &mut region.native;

        let mut buffer = unsafe { Buffer::from_raw(native as *mut c_void) };
        let copy = buffer;

        assert!(buffer.is_valid());
        assert_eq!(buffer, copy);
        assert_eq!(buffer.ptr(), native as *const c_void);
        assert_eq!(buffer.ptr_mut(), native as *mut c_void);
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.raw_ptr(), region.body.as_mut_ptr().wrapping_add(HEADER_SIZE));
    }
}
