//! Allocator types, both generic and host-specific.
//!
//! ## Basic Types
//!
//! ### [`Allocator`](trait.Allocator.html)
//!
//! The capability interface every backend implements: `malloc`, `free` and
//! `size` over [`Buffer`](../struct.Buffer.html) handles.
//!
//! ### [`HeaderAllocator`](struct.HeaderAllocator.html)
//!
//! A `HeaderAllocator` lays out each allocation as a `NativeBuffer`, then a
//! `MemControl` header, then the usable bytes, all in one block taken from a
//! [`RawHeap`](trait.RawHeap.html). Freeing drops one reference and only
//! returns the block to the heap when the last holder is gone.
//!
//! ### [`CommonAllocator`](struct.CommonAllocator.html)
//!
//! The process-wide host allocator, a `HeaderAllocator` over the host heap.
//! It can only be reached through [`allocator`](../fn.allocator.html).
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a heap with a fixed capacity, so that running out of memory
//! is easy to arrange. It is mainly useful for testing.

use core::alloc::Layout;
use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{trace, warn};
use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::buffer::{Buffer, NativeBuffer};
use crate::control::{MemControl, HEADER_SIZE};

/// Alignment of every block, and so of every header and data pointer.
pub const ALIGN: usize = 16;

const NATIVE_SIZE: usize = core::mem::size_of::<NativeBuffer>();
const_assert_eq!(NATIVE_SIZE % ALIGN, 0);
const_assert_eq!(HEADER_SIZE % ALIGN, 0);

/// A memory allocator.
///
/// Allocators are referenced, never duplicated: implementations should not
/// be `Clone`, and callers hold them as `&dyn Allocator`.
pub trait Allocator: Sync {
    /// Allocate a buffer with at least `size` usable bytes.
    ///
    /// `allow_swap` lets a backend fall back to a slower strategy when its
    /// primary pool is exhausted. On failure this returns the null buffer.
    fn malloc(&self, size: usize, allow_swap: bool) -> Buffer;

    /// Release a buffer. Freeing the null buffer does nothing.
    ///
    /// # Safety
    ///
    /// `buffer` must have come from this allocator, and no copy of it may be
    /// used once the allocation is actually released.
    unsafe fn free(&self, buffer: Buffer);

    /// Usable bytes of `buffer`.
    fn size(&self, buffer: Buffer) -> usize;
}

/// A source of raw, aligned blocks of memory.
pub trait RawHeap {
    type Err: fmt::Debug;

    /// Reserve `size` contiguous bytes aligned to [`ALIGN`].
    ///
    /// # Safety
    ///
    /// `size` must be non-zero.
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Give back a block from `reserve`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must match one earlier `reserve` call, and the block
    /// must not be used afterward.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory")
    }
}

/// The Rust global allocator.
#[derive(Default, Debug)]
pub struct SystemHeap;

impl RawHeap for SystemHeap {
    type Err = OutOfMemory;

    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let layout = Layout::from_size_align(size, ALIGN).map_err(|_| OutOfMemory)?;
        NonNull::new(alloc::alloc::alloc(layout)).ok_or(OutOfMemory)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, ALIGN);
        alloc::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// The C library heap, through `posix_memalign` and `free`.
#[cfg(feature = "use_libc")]
#[derive(Default, Debug)]
pub struct LibcHeap;

#[cfg(feature = "use_libc")]
impl RawHeap for LibcHeap {
    // The error code from posix_memalign
    type Err = libc::c_int;

    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, libc::c_int> {
        let mut ptr: *mut libc::c_void = core::ptr::null_mut();
        let code = libc::posix_memalign(&mut ptr, ALIGN, size);
        if code != 0 {
            return Err(code);
        }
        NonNull::new(ptr as *mut u8).ok_or(libc::ENOMEM)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}

#[cfg(not(feature = "use_libc"))]
type HostHeap = SystemHeap;
#[cfg(feature = "use_libc")]
type HostHeap = LibcHeap;

/// A heap that refuses to hand out more than `capacity` bytes in total.
pub struct ToyHeap {
    capacity: usize,
    used: Mutex<usize>,
    heap: SystemHeap,
}

#[derive(Debug)]
pub struct ToyHeapOverflowError();

impl ToyHeap {
    pub fn new(capacity: usize) -> Self {
        ToyHeap {
            capacity,
            used: Mutex::new(0),
            heap: SystemHeap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently reserved, including per-block overhead.
    pub fn used(&self) -> usize {
        *self.used.lock()
    }
}

impl RawHeap for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let mut used = self.used.lock();
        if size > self.capacity - *used {
            return Err(ToyHeapOverflowError());
        }
        let ptr = self
            .heap
            .reserve(size)
            .map_err(|_| ToyHeapOverflowError())?;
        *used += size;
        Ok(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let mut used = self.used.lock();
        self.heap.release(ptr, size);
        *used -= size;
    }
}

/// Live allocations of an allocator.
///
/// The two counters are read separately, so a snapshot taken while other
/// threads allocate may pair a count with a slightly different byte total.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of live allocations
    pub length: usize,
    /// Usable bytes across live allocations
    pub size: usize,
}

/// An allocator placing a `MemControl` header before every allocation,
/// taking its blocks from a [`RawHeap`](trait.RawHeap.html).
pub struct HeaderAllocator<H> {
    heap: H,
    length: AtomicUsize,
    size: AtomicUsize,
}

impl<H: Default> Default for HeaderAllocator<H> {
    fn default() -> Self {
        HeaderAllocator::new(H::default())
    }
}

impl<H> HeaderAllocator<H> {
    pub const fn new(heap: H) -> Self {
        HeaderAllocator {
            heap,
            length: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn stats(&self) -> Stats {
        Stats {
            length: self.length.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }

    /// Bytes taken from the heap for `size` usable bytes, or `None` if that
    /// overflows.
    pub fn block_size(size: usize) -> Option<usize> {
        (NATIVE_SIZE + HEADER_SIZE).checked_add(size)
    }
}

impl<H: RawHeap + Sync> Allocator for HeaderAllocator<H> {
    fn malloc(&self, size: usize, allow_swap: bool) -> Buffer {
        if size == 0 {
            trace!("malloc(0): returning the null buffer");
            return Buffer::null();
        }

        let total = match Self::block_size(size) {
            Some(total) => total,
            None => {
                warn!("malloc({}): size overflows the block layout", size);
                return Buffer::null();
            }
        };

        let base = match unsafe { self.heap.reserve(total) } {
            Ok(base) => base,
            Err(err) => {
                warn!(
                    "malloc({}): heap refused {} bytes (allow_swap={}): {:?}",
                    size, total, allow_swap, err
                );
                return Buffer::null();
            }
        };

        // [NativeBuffer][MemControl][size usable bytes]
        let buffer = unsafe {
            let native: NonNull<NativeBuffer> = base.cast();
            let contents = NonNull::new_unchecked(base.as_ptr().add(NATIVE_SIZE));
            core::ptr::write(
                native.as_ptr(),
                NativeBuffer::new(contents.as_ptr(), HEADER_SIZE + size),
            );
            MemControl::write(contents, native.as_ptr() as *mut c_void);
            Buffer::from_raw(native.as_ptr() as *mut c_void)
        };

        self.length.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size, Ordering::Relaxed);
        trace!("malloc({}) -> {:?}", size, buffer.raw_ptr());

        buffer
    }

    unsafe fn free(&self, buffer: Buffer) {
        if !buffer.is_valid() {
            return;
        }

        let remaining = MemControl::of_buffer(buffer).release();
        if remaining > 0 {
            trace!("free({:?}): {} holders remain", buffer.raw_ptr(), remaining);
            return;
        }

        let usable = MemControl::usable_size(buffer);
        let total = NATIVE_SIZE + buffer.size();
        trace!("free({:?}): releasing {} bytes", buffer.raw_ptr(), total);
        self.heap
            .release(NonNull::new_unchecked(buffer.ptr() as *mut u8), total);

        self.length.fetch_sub(1, Ordering::Relaxed);
        self.size.fetch_sub(usable, Ordering::Relaxed);
    }

    fn size(&self, buffer: Buffer) -> usize {
        MemControl::usable_size(buffer)
    }
}

/// A general host-memory allocator.
///
/// There is exactly one, built on first use of
/// [`allocator`](../fn.allocator.html). It has no slower fallback, so
/// `allow_swap` makes no difference here.
pub struct CommonAllocator {
    alloc: HeaderAllocator<HostHeap>,
}

impl CommonAllocator {
    pub(crate) const fn new() -> Self {
        CommonAllocator {
            alloc: HeaderAllocator::new(HostHeap {}),
        }
    }

    pub fn stats(&self) -> Stats {
        self.alloc.stats()
    }
}

impl Allocator for CommonAllocator {
    fn malloc(&self, size: usize, allow_swap: bool) -> Buffer {
        self.alloc.malloc(size, allow_swap)
    }

    unsafe fn free(&self, buffer: Buffer) {
        self.alloc.free(buffer)
    }

    fn size(&self, buffer: Buffer) -> usize {
        self.alloc.size(buffer)
    }
}
