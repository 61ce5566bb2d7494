//! Waiting on outstanding work when memory runs out.
//!
//! Asynchronous computations can pin buffers until they retire. When an
//! allocation fails, [`malloc_or_wait`](../fn.malloc_or_wait.html) waits once
//! for that work to drain through the registered [`TaskEngine`], then retries
//! once with swap allowed.
//!
//! [`TaskEngine`]: trait.TaskEngine.html

use core::fmt;

use log::{debug, warn};
use spin::Once;

use crate::allocators::Allocator;
use crate::buffer::Buffer;

/// The task-execution engine, as far as allocation is concerned.
pub trait TaskEngine: Sync {
    /// Block until outstanding asynchronous work has retired, releasing the
    /// memory it held.
    fn wait_for_outstanding(&self);
}

// Used until an engine is registered: there is never anything to wait for.
struct Idle;

impl TaskEngine for Idle {
    fn wait_for_outstanding(&self) {}
}

static IDLE: Idle = Idle;
static ENGINE: Once<&'static dyn TaskEngine> = Once::new();

/// Returned by [`register_task_engine`](fn.register_task_engine.html) when an
/// engine is already in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineAlreadyRegistered;

impl fmt::Display for EngineAlreadyRegistered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a task engine is already registered")
    }
}

/// Install the engine `malloc_or_wait` waits on. This can happen once per
/// process.
pub fn register_task_engine(
    engine: &'static dyn TaskEngine,
) -> Result<(), EngineAlreadyRegistered> {
    let mut installed = false;
    ENGINE.call_once(|| {
        installed = true;
        engine
    });

    if installed {
        debug!("Registered task engine");
        Ok(())
    } else {
        Err(EngineAlreadyRegistered)
    }
}

/// The registered engine, or one with no outstanding work if none was
/// registered.
pub fn task_engine() -> &'static dyn TaskEngine {
    match ENGINE.r#try() {
        Some(&engine) => engine,
        None => &IDLE,
    }
}

/// Allocate from `allocator`, waiting once on `engine` if the first attempt
/// fails.
///
/// The retry is made with `allow_swap` set. If it fails too, the null buffer
/// is returned. A zero-sized request returns the null buffer without
/// waiting.
///
/// This can block for as long as the engine takes to drain.
pub fn malloc_or_wait_with(
    allocator: &dyn Allocator,
    engine: &dyn TaskEngine,
    size: usize,
) -> Buffer {
    if size == 0 {
        return Buffer::null();
    }

    let buffer = allocator.malloc(size, false);
    if buffer.is_valid() {
        return buffer;
    }

    debug!("malloc({}) failed, waiting for outstanding work", size);
    engine.wait_for_outstanding();

    let buffer = allocator.malloc(size, true);
    if !buffer.is_valid() {
        warn!("malloc({}) failed after waiting for outstanding work", size);
    }
    buffer
}
