use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use buffer_alloc::allocators::{Allocator, HeaderAllocator, Stats, ToyHeap};
use buffer_alloc::{free, malloc, Buffer, MemControl};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

// Fill a buffer with a byte derived from its address, so overlapping
// allocations show up as corrupted contents.
fn fill(buffer: Buffer, size: usize) {
    let tag = (buffer.raw_ptr() as usize >> 4) as u8;
    unsafe { std::ptr::write_bytes(buffer.raw_ptr(), tag, size) };
}

fn check(buffer: Buffer, size: usize) {
    let tag = (buffer.raw_ptr() as usize >> 4) as u8;
    let data = unsafe { std::slice::from_raw_parts(buffer.raw_ptr(), size) };
    assert!(data.iter().all(|&b| b == tag), "buffer {:?} was overwritten", buffer);
}

#[test]
fn test_stress() {
    let allocator = HeaderAllocator::new(ToyHeap::new(64 * 1024));

    // A null buffer means not allocated; the extra holders are the number of
    // retains on top of the allocation's own reference.
    let mut slots: [(Buffer, usize, u8); 128] = [(Buffer::null(), 0, 0); 128];
    let mut allocated_size: usize = 0;
    let mut freed_size: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for _ in 0..1024 * 10 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        let &mut (buffer, size, extra) = chosen;

        if !buffer.is_valid() {
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let new_buffer = allocator.malloc(new_size, false);
            log::info!("Allocated {:?} {}", new_buffer, new_size);
            if !new_buffer.is_valid() {
                // The toy heap is full; that is fine.
                continue;
            }
            assert_eq!(allocator.size(new_buffer), new_size);
            fill(new_buffer, new_size);
            *chosen = (new_buffer, new_size, 0);
            allocated_size += new_size;
        } else if extra < 3 && range.sample(&mut rng) % 4 == 0 {
            let ctrl = unsafe { MemControl::of_buffer(buffer) };
            ctrl.retain().unwrap();
            chosen.2 += 1;
        } else {
            check(buffer, size);
            unsafe { allocator.free(buffer) };
            if extra > 0 {
                chosen.2 -= 1;
            } else {
                *chosen = (Buffer::null(), 0, 0);
                freed_size += size;
            }
        }

        let stats = allocator.stats();
        assert_eq!(stats.size, allocated_size - freed_size);
        assert_eq!(
            allocator.heap().used(),
            stats.size + stats.length * HeaderAllocator::<ToyHeap>::block_size(0).unwrap()
        );
    }

    for &(buffer, size, extra) in slots.iter() {
        if buffer.is_valid() {
            check(buffer, size);
            for _ in 0..=extra {
                unsafe { allocator.free(buffer) };
            }
        }
    }
    assert_eq!(allocator.stats(), Stats::default());
    assert_eq!(allocator.heap().used(), 0);
}

#[test]
fn test_concurrent_global_allocations() {
    const THREADS: usize = 8;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(t as u64);
                let range = rand::distributions::Uniform::new_inclusive(1usize, 512);
                let mut live: Vec<(Buffer, usize)> = Vec::new();

                for _ in 0..2000 {
                    if live.len() < 16 && range.sample(&mut rng) % 2 == 0 {
                        let size = range.sample(&mut rng);
                        let buffer = malloc(size);
                        assert!(buffer.is_valid());
                        fill(buffer, size);
                        live.push((buffer, size));
                    } else if let Some((buffer, size)) = live.pop() {
                        check(buffer, size);
                        unsafe { free(buffer) };
                    }
                }

                for (buffer, size) in live {
                    check(buffer, size);
                    unsafe { free(buffer) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_shared_buffer_refcount() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 5000;

    let buffer = malloc(1024);
    assert!(buffer.is_valid());
    fill(buffer, 1024);

    let saw_zero = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let saw_zero = Arc::clone(&saw_zero);
            thread::spawn(move || {
                let ctrl = unsafe { MemControl::of_buffer(buffer) };
                for _ in 0..ROUNDS {
                    ctrl.retain().unwrap();
                    if ctrl.ref_count() == 0 {
                        saw_zero.store(true, Ordering::SeqCst);
                    }
                    // Releasing through the allocator drops our holder only
                    unsafe { free(buffer) };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!saw_zero.load(Ordering::SeqCst));
    let ctrl = unsafe { MemControl::of_buffer(buffer) };
    assert_eq!(ctrl.ref_count(), 1);
    check(buffer, 1024);
    unsafe { free(buffer) };
}
