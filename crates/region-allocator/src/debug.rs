//! Read-only views of a region for diagnostic tooling.
//!
//! Every allocator implements [`RegionInspect`]. A snapshot walks the region's
//! all-allocations list from the most recent allocation backwards while
//! holding the allocator's lock, so it always observes a consistent state.
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use region_allocator::{
//!     debug::{self, DebugMemoryBlock},
//!     stack::StackAllocator,
//!     tracking::NoTracking,
//! };
//!
//! let mut heap = vec![0_u8; 1024];
//! let stack = StackAllocator::<NoTracking>::new(NoTracking);
//! unsafe {
//!     stack.map(NonNull::new(heap.as_mut_ptr()).unwrap(), heap.len(), "frame");
//! }
//! let _a = stack.allocate(32).unwrap();
//! let _b = stack.allocate(64).unwrap();
//!
//! let mut blocks = [DebugMemoryBlock::EMPTY; 8];
//! let count = debug::extract_snapshot(&stack, &mut blocks).unwrap();
//! assert_eq!(count, 2);
//! assert!(blocks[0].frame_address > blocks[1].frame_address);
//! ```

use arrayvec::ArrayString;

use crate::{
    config::{REGION_NAME_CAPACITY, SNAPSHOT_DESCRIPTION_CAPACITY},
    error::AllocError,
};

/// One live frame of a region, as reported by a snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugMemoryBlock {
    /// Unaligned start of the frame.
    pub frame_address: usize,
    /// Total bytes spanned by the frame.
    pub frame_size: usize,
    /// Description recorded by the tracking policy; empty when untracked.
    pub description: ArrayString<SNAPSHOT_DESCRIPTION_CAPACITY>,
    pub is_allocated: bool,
}

impl DebugMemoryBlock {
    pub const EMPTY: Self = Self {
        frame_address: 0,
        frame_size: 0,
        description: ArrayString::new_const(),
        is_allocated: false,
    };
}

/// Summary of a mapped region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub name: ArrayString<REGION_NAME_CAPACITY>,
    pub base_address: usize,
    pub size_in_bytes: usize,
    pub used_bytes: usize,
}

/// Diagnostic access to a region, shared by all allocators.
pub trait RegionInspect {
    /// Returns the region's name, bounds and usage.
    fn info(&self) -> RegionInfo;

    /// Writes one [`DebugMemoryBlock`] per live allocation into `out`, most
    /// recent allocation first, and returns the number written.
    ///
    /// Fails with [`SnapshotOverflow`] when `out` cannot hold every live
    /// allocation; entries past `out.len()` are never written.
    ///
    /// [`SnapshotOverflow`]: crate::error::AllocErrorKind::SnapshotOverflow
    fn snapshot(&self, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError>;
}

/// Extracts a snapshot of `region` into `out`.
///
/// This is the entry point used by visualization tools that only hold a
/// `&dyn RegionInspect`.
pub fn extract_snapshot<R>(region: &R, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError>
where
    R: RegionInspect + ?Sized,
{
    region.snapshot(out)
}
