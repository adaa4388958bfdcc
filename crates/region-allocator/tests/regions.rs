//! End-to-end tests: several regions carved out of one buffer and inspected
//! through `dyn RegionInspect`.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{iter, ptr::NonNull};

use region_allocator::{
    FreelistAllocator, PoolAllocator, StackAllocator,
    config::kib,
    debug::{self, DebugMemoryBlock, RegionInspect},
    header::VariableSizeHeader,
    tracker,
    tracking::{DefaultTracking, NoTracking},
};

#[test]
fn regions_share_one_buffer() {
    let sizes = [kib(2), kib(4), kib(2)];
    let mut buffer = vec![0_u128; sizes.iter().sum::<usize>() / 16];
    let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

    let stack = StackAllocator::<NoTracking>::new(NoTracking);
    let freelist = FreelistAllocator::<NoTracking>::new(NoTracking);
    let pool = PoolAllocator::<NoTracking>::new(NoTracking, 64);
    unsafe {
        stack.map(base, sizes[0], "scratch");
        let freelist_base = base.add(sizes[0]);
        freelist.map(freelist_base, sizes[1], "general").unwrap();
        let pool_base = freelist_base.add(sizes[1]);
        pool.map(pool_base, sizes[2], "particles").unwrap();
    }

    let scratch = stack.allocate(100).unwrap();
    let general = [
        freelist.allocate(200).unwrap(),
        freelist.allocate(300).unwrap(),
    ];
    let particles: Vec<_> = iter::repeat_with(|| pool.allocate().unwrap())
        .take(3)
        .collect();

    let regions: [&dyn RegionInspect; 3] = [&stack, &freelist, &pool];
    let mut blocks = [DebugMemoryBlock::EMPTY; 8];
    let counts: Vec<_> = regions
        .iter()
        .map(|region| debug::extract_snapshot(*region, &mut blocks).unwrap())
        .collect();
    assert_eq!(counts, [1, 2, 3]);

    let mut end = base.as_ptr().addr();
    for (region, size) in regions.iter().zip(sizes) {
        let info = region.info();
        assert_eq!(info.base_address, end);
        assert_eq!(info.size_in_bytes, size);
        assert!(info.used_bytes > 0);
        end += size;

        let count = region.snapshot(&mut blocks).unwrap();
        for block in &blocks[..count] {
            assert!(block.is_allocated);
            assert!(block.frame_address >= info.base_address);
            let frame_end = block.frame_address + block.frame_size;
            assert!(frame_end <= info.base_address + size);
        }
    }
    assert_eq!(stack.info().name.as_str(), "scratch");

    unsafe {
        stack.free(scratch).unwrap();
        for ptr in general {
            freelist.free(ptr).unwrap();
        }
        for ptr in particles {
            pool.free(ptr).unwrap();
        }
    }
    for region in regions {
        assert_eq!(region.info().used_bytes, 0);
        assert_eq!(region.snapshot(&mut blocks).unwrap(), 0);
    }
}

#[test]
fn header_recovery_round_trips() {
    // tracked headers are larger than untracked ones
    assert!(
        VariableSizeHeader::<region_allocator::tracking::TrackedHeader>::padded_size(16)
            > VariableSizeHeader::<region_allocator::tracking::UntrackedHeader>::padded_size(16)
    );

    let mut buffer = vec![0_u128; kib(4) / 16];
    let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
    let stack = StackAllocator::<NoTracking, 8>::new(NoTracking);
    unsafe {
        stack.map(base, kib(4), "round trip");
    }

    let ptrs: Vec<_> = (0..10).map(|i| stack.allocate(i * 7).unwrap()).collect();
    let mut blocks = [DebugMemoryBlock::EMPTY; 10];
    assert_eq!(stack.snapshot(&mut blocks).unwrap(), 10);
    // most recent first, and every data pointer lies inside its own frame
    for (block, ptr) in blocks.iter().zip(ptrs.iter().rev()) {
        let data = ptr.as_ptr().addr();
        assert_eq!(data % 8, 0);
        assert!(data > block.frame_address);
        assert!(data <= block.frame_address + block.frame_size);
    }
    stack.free_all();
    assert_eq!(stack.used_bytes(), 0);
}

#[test]
fn global_tracker_lifecycle() {
    let mut tracking = vec![0_u128; kib(64) / 16];
    unsafe {
        tracker::init_global(
            NonNull::new(tracking.as_mut_ptr().cast::<u8>()).unwrap(),
            kib(64),
        )
        .unwrap();
    }
    let global = tracker::global();
    assert!(global.capacity() > 0);

    let mut buffer = vec![0_u128; kib(4) / 16];
    let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();
    let freelist = FreelistAllocator::<DefaultTracking<'static>>::default();
    unsafe {
        freelist.map(base, kib(4), "global").unwrap();
    }

    let line = line!() + 1;
    let ptr = freelist.allocate_with(48, "config blob").unwrap();
    assert_eq!(global.live_allocations(), 1);
    let mut seen = 0;
    global.for_each_entry(|entry| {
        seen += 1;
        assert_eq!(entry.address(), ptr.as_ptr().addr());
        assert_eq!(entry.size_in_bytes(), 48);
        assert_eq!(entry.description(), "config blob");
        let call_site = format!("{}:{line}", file!());
        assert!(entry.stack_trace().contains(&call_site));
    });
    assert_eq!(seen, 1);

    unsafe {
        freelist.free(ptr).unwrap();
    }
    assert_eq!(global.live_allocations(), 0);
    tracker::shutdown_global();
    assert_eq!(global.capacity(), 0);
}
