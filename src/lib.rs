#![cfg_attr(not(test), no_std)]

//! Buffer allocation for a numerical runtime.
//!
//! Allocations hand out a [`Buffer`], an opaque handle to a native buffer
//! object. Every allocation keeps a small [`MemControl`] header right before
//! its usable data, holding the native handle and an atomic reference count,
//! so both can be recovered from nothing but a data pointer.
//!
//! The process-wide allocator is reached through [`allocator`]; [`malloc`],
//! [`malloc_or_wait`] and [`free`] are shortcuts over it.
//!
//! [`Buffer`]: struct.Buffer.html
//! [`MemControl`]: struct.MemControl.html
//! [`allocator`]: fn.allocator.html
//! [`malloc`]: fn.malloc.html
//! [`malloc_or_wait`]: fn.malloc_or_wait.html
//! [`free`]: fn.free.html

extern crate alloc;

use log::debug;
use spin::Once;

pub mod allocators;
pub mod backpressure;
mod buffer;
mod control;

pub use allocators::{Allocator, CommonAllocator};
pub use backpressure::{malloc_or_wait_with, register_task_engine, TaskEngine};
pub use buffer::{Buffer, NativeBuffer};
pub use control::{MemControl, RefCountOverflow, HEADER_SIZE, MAX_REF_COUNT};

static ALLOCATOR: Once<CommonAllocator> = Once::new();

/// The process-wide allocator.
///
/// It is built on first use and lives until the process exits.
pub fn allocator() -> &'static dyn Allocator {
    ALLOCATOR.call_once(|| {
        debug!("Initializing the common allocator");
        CommonAllocator::new()
    })
}

/// Allocate `size` bytes from the global allocator, without swap.
///
/// Returns the null buffer on failure.
pub fn malloc(size: usize) -> Buffer {
    allocator().malloc(size, false)
}

/// Free a buffer from [`malloc`](fn.malloc.html) or
/// [`malloc_or_wait`](fn.malloc_or_wait.html).
///
/// # Safety
///
/// See [`Allocator::free`](trait.Allocator.html#tymethod.free).
pub unsafe fn free(buffer: Buffer) {
    allocator().free(buffer)
}

/// Allocate `size` bytes, waiting for outstanding work to retire if memory
/// is short.
///
/// Waits at most once on the registered
/// [`TaskEngine`](trait.TaskEngine.html) before retrying with swap allowed.
/// Returns the null buffer if that retry fails too.
pub fn malloc_or_wait(size: usize) -> Buffer {
    malloc_or_wait_with(allocator(), backpressure::task_engine(), size)
}
