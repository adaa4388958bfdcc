//! Region-based allocation schemes for caller-supplied memory.
//!
//! Each allocator overlays one strategy on a byte buffer that the caller has
//! already reserved. The allocator never owns the buffer: it is bound with
//! `map` and simply stops being used when the caller reclaims it.
//!
//! # Available Allocators
//!
//! ## [`StackAllocator`]
//!
//! A LIFO bump allocator. Allocation bumps a marker; only the most recent
//! live allocation may be freed. Best suited for per-frame or per-request
//! scratch memory that is released all at once.
//!
//! **Performance**: O(1) allocation and deallocation.
//!
//! ## [`PoolAllocator`]
//!
//! A fixed-size slot allocator with LIFO slot reuse. Best suited for many
//! objects of one type.
//!
//! **Performance**: O(1) allocation and deallocation.
//!
//! ## [`FreelistAllocator`]
//!
//! A general-purpose allocator with first-fit search, block splitting and
//! coalescing of adjacent free blocks.
//!
//! **Performance**: O(n) allocation and deallocation where n is the number of
//! free blocks.
//!
//! # Tracking
//!
//! Every allocator takes a [`TrackingPolicy`](tracking::TrackingPolicy) type
//! parameter. [`NoTracking`](tracking::NoTracking) adds nothing to the
//! allocation headers. [`DefaultTracking`](tracking::DefaultTracking) records
//! the size, description and call site of every live allocation in an
//! [`AllocationTracker`](tracker::AllocationTracker), which tooling can read
//! back together with [`debug::extract_snapshot`].
//!
//! # Usage Example
//!
//! ```rust
//! use core::ptr::NonNull;
//!
//! use region_allocator::{FreelistAllocator, tracking::NoTracking};
//!
//! let mut heap = vec![0_u8; 4096];
//! let allocator = FreelistAllocator::<NoTracking>::new(NoTracking);
//! unsafe {
//!     allocator
//!         .map(NonNull::new(heap.as_mut_ptr()).unwrap(), heap.len(), "assets")
//!         .unwrap();
//! }
//!
//! let ptr = allocator.allocate(64).unwrap();
//! // Use the allocated memory...
//! unsafe {
//!     allocator.free(ptr).unwrap();
//! }
//! assert_eq!(allocator.used_bytes(), 0);
//! ```
//!
//! # Thread Safety
//!
//! Every allocator guards its state with a single spin lock and is `Sync`
//! when its tracking policy is `Send`. Distinct allocators never share a
//! lock; tracked allocators additionally take the tracker's lock while
//! holding their own.
//!
//! # Cargo Features
//!
//! - `error-with-location` (default): errors record where they were created.
//! - `zero-fill`: zero payloads on allocation and frames on release.
//! - `backtrace`: append a captured backtrace to each debug entry's stack
//!   trace. Implies `std`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod align;
pub mod config;
pub mod debug;
pub mod error;
pub mod freelist;
pub mod header;
pub mod pool;
mod region;
pub mod stack;
pub mod tracker;
pub mod tracking;

pub use self::{
    error::{AllocError, AllocErrorKind},
    freelist::FreelistAllocator,
    pool::PoolAllocator,
    stack::StackAllocator,
};
