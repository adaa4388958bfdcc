//! Property tests: balanced allocate/free sequences leave every scheme as it
//! was right after `map`.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::ptr::NonNull;

use proptest::prelude::*;
use region_allocator::{
    FreelistAllocator, PoolAllocator, StackAllocator,
    config::{DEFAULT_ALIGNMENT, kib},
    tracker::AllocationTracker,
    tracking::{DefaultTracking, NoTracking},
};

/// A 16-aligned heap for one test case.
fn heap(size: usize) -> Vec<u128> {
    vec![0; size.div_ceil(16)]
}

fn base(heap: &mut [u128]) -> NonNull<u8> {
    NonNull::new(heap.as_mut_ptr().cast()).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    /// Frees the live allocation at `index % live.len()`.
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            3 => (0_usize..300).prop_map(Op::Allocate),
            2 => any::<usize>().prop_map(Op::Free),
        ],
        1..80,
    )
}

fn fill(ptr: NonNull<u8>, size: usize, tag: u8) {
    unsafe {
        ptr.as_ptr().write_bytes(tag, size);
    }
}

fn check(ptr: NonNull<u8>, size: usize, tag: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) }
        .iter()
        .all(|&byte| byte == tag)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stack_lifo_sequence_restores_marker(ops in ops()) {
        let size = kib(8);
        let mut heap = heap(size);
        let stack = StackAllocator::<NoTracking>::new(NoTracking);
        unsafe {
            stack.map(base(&mut heap), size, "prop stack");
        }

        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Allocate(n) => match stack.allocate(n) {
                    Ok(ptr) => {
                        prop_assert_eq!(ptr.as_ptr().addr() % DEFAULT_ALIGNMENT, 0);
                        let tag = i.to_le_bytes()[0];
                        fill(ptr, n, tag);
                        live.push((ptr, n, tag));
                    }
                    Err(err) => prop_assert!(err.kind().is_out_of_memory()),
                },
                Op::Free(_) => {
                    if let Some((ptr, n, tag)) = live.pop() {
                        prop_assert!(check(ptr, n, tag));
                        unsafe {
                            stack.free(ptr).unwrap();
                        }
                    }
                }
            }
        }
        while let Some((ptr, n, tag)) = live.pop() {
            prop_assert!(check(ptr, n, tag));
            unsafe {
                stack.free(ptr).unwrap();
            }
        }
        prop_assert_eq!(stack.used_bytes(), 0);
        prop_assert_eq!(stack.remaining_bytes(), size);
    }

    #[test]
    fn pool_sequence_restores_free_slots(ops in ops()) {
        let size = kib(4);
        let mut heap = heap(size);
        let pool = PoolAllocator::<NoTracking>::new(NoTracking, 40);
        unsafe {
            pool.map(base(&mut heap), size, "prop pool").unwrap();
        }
        let count = pool.element_count();

        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Allocate(_) => match pool.allocate() {
                    Ok(ptr) => live.push(ptr),
                    Err(err) => {
                        prop_assert!(err.kind().is_pool_exhausted());
                        prop_assert_eq!(live.len(), count);
                    }
                },
                Op::Free(index) => {
                    if !live.is_empty() {
                        let ptr = live.swap_remove(index % live.len());
                        unsafe {
                            pool.free(ptr).unwrap();
                        }
                        // the slot just freed is the next one handed out
                        let again = pool.allocate().unwrap();
                        prop_assert_eq!(again, ptr);
                        unsafe {
                            pool.free(again).unwrap();
                        }
                    }
                }
            }
            prop_assert_eq!(pool.free_slots() + live.len(), count);
        }
        for ptr in live {
            unsafe {
                pool.free(ptr).unwrap();
            }
        }
        prop_assert_eq!(pool.used_bytes(), 0);
        prop_assert_eq!(pool.free_slots(), count);
    }

    #[test]
    fn freelist_sequence_coalesces_back_to_one_block(ops in ops()) {
        let size = kib(8);
        let mut heap = heap(size);
        let allocator = FreelistAllocator::<NoTracking>::new(NoTracking);
        unsafe {
            allocator.map(base(&mut heap), size, "freelist").unwrap();
        }
        let capacity = allocator.largest_free_capacity();

        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        for (i, op) in ops.into_iter().enumerate() {
            match op {
                Op::Allocate(n) => match allocator.allocate(n) {
                    Ok(ptr) => {
                        prop_assert_eq!(ptr.as_ptr().addr() % DEFAULT_ALIGNMENT, 0);
                        let tag = i.to_le_bytes()[0];
                        fill(ptr, n, tag);
                        live.push((ptr, n, tag));
                    }
                    Err(err) => prop_assert!(err.kind().is_out_of_memory()),
                },
                Op::Free(index) => {
                    if !live.is_empty() {
                        let (ptr, n, tag) = live.swap_remove(index % live.len());
                        prop_assert!(check(ptr, n, tag));
                        unsafe {
                            allocator.free(ptr).unwrap();
                        }
                    }
                }
            }
        }
        for (ptr, n, tag) in live {
            prop_assert!(check(ptr, n, tag));
            unsafe {
                allocator.free(ptr).unwrap();
            }
        }
        prop_assert_eq!(allocator.used_bytes(), 0);
        prop_assert_eq!(allocator.free_block_count(), 1);
        prop_assert_eq!(allocator.largest_free_capacity(), capacity);
        prop_assert_eq!(allocator.allocation_count(), allocator.free_count());
    }

    #[test]
    fn tracked_live_count_is_allocations_minus_frees(
        sizes in proptest::collection::vec(1_usize..200, 1..40),
        frees in 0_usize..40,
    ) {
        let tracker = AllocationTracker::new();
        let mut tracking_heap = heap(kib(128));
        unsafe {
            tracker.init(base(&mut tracking_heap), kib(128)).unwrap();
        }

        let size = kib(16);
        let mut heap = heap(size);
        let allocator = FreelistAllocator::<_>::new(DefaultTracking::new(&tracker));
        unsafe {
            allocator.map(base(&mut heap), size, "tracked").unwrap();
        }

        let mut live: Vec<_> = sizes
            .iter()
            .map(|&n| allocator.allocate_with(n, "prop").unwrap())
            .collect();
        let frees = frees.min(live.len());
        for ptr in live.drain(..frees) {
            unsafe {
                allocator.free(ptr).unwrap();
            }
        }
        prop_assert_eq!(tracker.live_allocations(), sizes.len() - frees);

        let mut entries = 0;
        tracker.for_each_entry(|_| entries += 1);
        prop_assert_eq!(entries, sizes.len() - frees);

        allocator.free_all();
        prop_assert_eq!(tracker.live_allocations(), 0);
        tracker.shutdown();
    }
}
