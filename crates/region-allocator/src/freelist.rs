//! General-purpose allocator with first-fit search and coalescing.
//!
//! Free blocks are kept in a list sorted by address, linked through the same
//! `next`/`prev` header fields that link live frames in the all-allocations
//! list. A fresh mapping is a single free block spanning the whole region.
//!
//! # Algorithm
//!
//! - **Allocation**: the first free block with room for the payload wins. If
//!   what is left after carving the frame can still hold a minimal frame, the
//!   block is split and the tail stays free in the block's place; otherwise
//!   the whole block is handed out.
//! - **Deallocation**: the block is inserted back in address order and merged
//!   with its free neighbours when, and only when, their frames touch exactly.
//!
//! ```text
//! Free list (address order):
//!
//!   first_free ──► [free 0x1000, 96] ◄──► [free 0x1200, 512] ◄──► [free 0x1800, 2048]
//!
//! Freeing the frame at 0x1060..0x1200 merges all three of
//! 0x1000..0x1060, 0x1060..0x1200 and 0x1200..0x1400 into one block.
//! ```

use core::{
    any, fmt, iter, mem,
    panic::Location,
    ptr::{self, NonNull},
};

use arrayvec::ArrayString;
use spin::mutex::SpinMutex;
use tracing::{debug, trace};

use crate::{
    align::align_ptr,
    config::{DEFAULT_ALIGNMENT, DESCRIPTION_CAPACITY},
    debug::{DebugMemoryBlock, RegionInfo, RegionInspect},
    error::{AllocError, AllocErrorKind},
    header::{self, AllocHeader, VariableSize, VariableSizeHeader},
    region::{self, Region},
    tracking::{AllocationRecord, NoTracking, TrackingPolicy},
};

type Header<P> = VariableSizeHeader<<P as TrackingPolicy>::Header>;

pub(crate) struct FreelistScheme<P: TrackingPolicy, const ALIGN: usize> {
    region: Region<VariableSize, P::Header>,
    first_free: *mut Header<P>,
    allocation_count: usize,
    free_count: usize,
    policy: P,
}

unsafe impl<P: TrackingPolicy + Send, const ALIGN: usize> Send for FreelistScheme<P, ALIGN> {}

impl<P, const ALIGN: usize> FreelistScheme<P, ALIGN>
where
    P: TrackingPolicy,
{
    const HEADER_SIZE: usize = Header::<P>::padded_size(ALIGN);

    /// Smallest frame worth keeping on the free list.
    pub(crate) const MIN_FRAME_SIZE: usize = Self::HEADER_SIZE + ALIGN + 1;

    pub(crate) const fn new(policy: P) -> Self {
        const { assert!(ALIGN.is_power_of_two()) };
        Self {
            region: Region::new(),
            first_free: ptr::null_mut(),
            allocation_count: 0,
            free_count: 0,
            policy,
        }
    }

    pub(crate) const fn frame_size_for(size: usize) -> usize {
        size.saturating_add(ALIGN + Self::HEADER_SIZE)
    }

    /// # Safety
    ///
    /// `base..base + size` must be valid for reads and writes and exclusively
    /// owned by this scheme until it is remapped.
    pub(crate) unsafe fn map(
        &mut self,
        base: NonNull<u8>,
        size: usize,
        name: &str,
    ) -> Result<(), AllocError> {
        if size < Self::MIN_FRAME_SIZE || base.as_ptr().addr().checked_add(size).is_none() {
            return Err(AllocErrorKind::RegionTooSmall {
                size,
                required: Self::MIN_FRAME_SIZE,
            }
            .into());
        }
        self.region.unregister_all(&self.policy);
        self.region.bind(base.as_ptr(), size, name);
        self.allocation_count = 0;
        self.free_count = 0;
        self.reset_free_list();
        debug!(
            region = name,
            base = base.as_ptr().addr(),
            size,
            "freelist mapped"
        );
        Ok(())
    }

    /// Makes the whole region one free block.
    fn reset_free_list(&mut self) {
        let base = self.region.base();
        if base.is_null() {
            self.first_free = ptr::null_mut();
            return;
        }
        let header = align_ptr(base, ALIGN).cast::<Header<P>>();
        let adjustment = header.addr() - base.addr();
        unsafe {
            AllocHeader::init_frame(header, self.region.size(), adjustment, P::Header::default());
        }
        self.first_free = header;
    }

    /// Iterates over the free blocks in address order.
    fn free_blocks(&self) -> impl Iterator<Item = *mut Header<P>> {
        let first = (!self.first_free.is_null()).then_some(self.first_free);
        iter::successors(first, |&block| {
            let next = unsafe { AllocHeader::next(block) };
            (!next.is_null()).then_some(next)
        })
    }

    pub(crate) fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    fn largest_free_frame(&self) -> usize {
        self.free_blocks()
            .map(|block| unsafe { AllocHeader::frame_size(block) })
            .max()
            .unwrap_or(0)
    }

    /// Largest payload a single allocation could currently get.
    pub(crate) fn largest_free_capacity(&self) -> usize {
        self.largest_free_frame()
            .saturating_sub(ALIGN + Self::HEADER_SIZE)
    }

    pub(crate) fn allocate(
        &mut self,
        size: usize,
        description: Option<&str>,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        let required = Self::frame_size_for(size);
        let Some(block) = self
            .free_blocks()
            .find(|&block| unsafe { AllocHeader::frame_size(block) } >= required)
        else {
            return Err(AllocErrorKind::OutOfMemory {
                requested: required,
                available: self.largest_free_frame(),
            }
            .into());
        };

        unsafe {
            let remainder = AllocHeader::frame_size(block) - required;
            if remainder >= Self::MIN_FRAME_SIZE {
                AllocHeader::set_frame_size(block, required);
                let rest_start = AllocHeader::frame_end(block);
                let rest = align_ptr(rest_start, ALIGN).cast::<Header<P>>();
                AllocHeader::init_frame(
                    rest,
                    remainder,
                    rest.addr() - rest_start.addr(),
                    P::Header::default(),
                );
                AllocHeader::replace(&mut self.first_free, block, rest);
            } else {
                AllocHeader::unlink(Some(&mut self.first_free), None, block);
            }
            self.region.push_allocation(block);
        }

        let (frame_size, frame_end) =
            unsafe { (AllocHeader::frame_size(block), AllocHeader::frame_end(block)) };
        self.region.add_used(frame_size);
        self.allocation_count += 1;

        let data = unsafe { AllocHeader::data(block, Self::HEADER_SIZE) };
        unsafe {
            header::zero_fill(data, frame_end.addr() - data.addr());
        }
        let tracking = self.policy.register(&AllocationRecord {
            address: data.addr(),
            size,
            description,
            location,
        });
        unsafe {
            AllocHeader::set_tracking(block, tracking);
        }

        trace!(
            region = self.region.name(),
            address = data.addr(),
            size,
            frame_size,
            "freelist allocate"
        );
        // blocks lie inside a mapped, non-null buffer
        Ok(unsafe { NonNull::new_unchecked(data) })
    }

    pub(crate) fn checked_header(&self, data: NonNull<u8>) -> Result<*mut Header<P>, AllocError> {
        self.region.header_of(data.as_ptr(), Self::HEADER_SIZE)
    }

    /// # Safety
    ///
    /// `block` must be a live allocation returned by [`Self::checked_header`].
    pub(crate) unsafe fn release(&mut self, block: *mut Header<P>) {
        let frame_size = unsafe { AllocHeader::frame_size(block) };
        self.region.sub_used(frame_size);
        unsafe {
            self.policy.unregister(AllocHeader::tracking(block));
            AllocHeader::set_tracking(block, P::Header::default());
        }
        self.free_count += 1;

        unsafe {
            self.region.remove_allocation(block);
            let data = AllocHeader::data(block, Self::HEADER_SIZE);
            header::zero_fill(data, AllocHeader::frame_end(block).addr() - data.addr());
            self.insert_free_block(block);
        }
        trace!(
            region = self.region.name(),
            address = block.addr(),
            frame_size,
            free_blocks = self.free_block_count(),
            "freelist free"
        );
    }

    /// Inserts `block` into the free list in address order and merges it with
    /// its neighbours.
    ///
    /// # Safety
    ///
    /// `block` must be an initialized header that is linked in no list and
    /// whose frame overlaps no free block.
    unsafe fn insert_free_block(&mut self, block: *mut Header<P>) {
        // the successor is the first free block at a higher address; when
        // there is none the block goes to the end of the list
        let mut prev = ptr::null_mut();
        let mut next = self.first_free;
        while !next.is_null() && next.addr() < block.addr() {
            prev = next;
            next = unsafe { AllocHeader::next(next) };
        }
        assert!(!ptr::eq(next, block), "block is already free");

        unsafe {
            AllocHeader::insert_between(&mut self.first_free, block, prev, next);

            let merged = if !prev.is_null() && AllocHeader::can_join(prev, block) {
                self.join(prev, block);
                prev
            } else {
                block
            };
            let next = AllocHeader::next(merged);
            if !next.is_null() && AllocHeader::can_join(merged, next) {
                self.join(merged, next);
            }
        }
    }

    /// Absorbs `right` into `left`.
    ///
    /// # Safety
    ///
    /// Both blocks must be adjacent in the free list and satisfy
    /// [`AllocHeader::can_join`].
    unsafe fn join(&mut self, left: *mut Header<P>, right: *mut Header<P>) {
        unsafe {
            assert!(
                AllocHeader::can_join(left, right),
                "frames must be contiguous"
            );
            let frame_size = AllocHeader::frame_size(left) + AllocHeader::frame_size(right);
            AllocHeader::unlink(Some(&mut self.first_free), None, right);
            AllocHeader::set_frame_size(left, frame_size);
        }
    }

    /// Allocates a new block, copies the payload over and frees the old one.
    pub(crate) fn reallocate(
        &mut self,
        data: NonNull<u8>,
        new_size: usize,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        let block = self.checked_header(data)?;
        let (old_capacity, tracking) = unsafe {
            (
                AllocHeader::frame_end(block).addr() - data.as_ptr().addr(),
                AllocHeader::tracking(block),
            )
        };
        let mut description = ArrayString::<DESCRIPTION_CAPACITY>::new();
        self.policy.describe(tracking, &mut description);
        let description = (!description.is_empty()).then_some(description.as_str());

        let new_data = self.allocate(new_size, description, location)?;
        let len = old_capacity.min(new_size);
        unsafe {
            header::copy_payload(data.as_ptr(), new_data.as_ptr(), len);
            self.release(block);
        }
        Ok(new_data)
    }

    pub(crate) fn free_all(&mut self) {
        self.region.unregister_all(&self.policy);
        self.region.clear_allocations();
        unsafe {
            header::zero_fill(self.region.base(), self.region.size());
        }
        self.reset_free_list();
        debug!(region = self.region.name(), "freelist cleared");
    }

    pub(crate) fn snapshot(&self, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError> {
        self.region.snapshot(&self.policy, 0, out)
    }
}

/// A locked variable-size allocator with first-fit search and coalescing.
///
/// `P` selects the tracking policy and `ALIGN` the alignment of every data
/// pointer handed out.
pub struct FreelistAllocator<P = NoTracking, const ALIGN: usize = DEFAULT_ALIGNMENT>
where
    P: TrackingPolicy,
{
    scheme: SpinMutex<FreelistScheme<P, ALIGN>>,
}

impl<P, const ALIGN: usize> fmt::Debug for FreelistAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.scheme.lock();
        f.debug_struct("FreelistAllocator")
            .field("info", &scheme.region.info())
            .field("free_blocks", &scheme.free_block_count())
            .field("allocation_count", &scheme.allocation_count)
            .field("free_count", &scheme.free_count)
            .finish()
    }
}

impl<P, const ALIGN: usize> Default for FreelistAllocator<P, ALIGN>
where
    P: TrackingPolicy + Default,
{
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P, const ALIGN: usize> FreelistAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    /// Smallest region [`Self::map`] accepts.
    pub const MIN_REGION_SIZE: usize = FreelistScheme::<P, ALIGN>::MIN_FRAME_SIZE;

    /// Creates an unmapped allocator.
    #[must_use]
    pub const fn new(policy: P) -> Self {
        Self {
            scheme: SpinMutex::new(FreelistScheme::new(policy)),
        }
    }

    /// Bytes of region a `size`-byte allocation consumes, unless the block it
    /// is carved from is too small to split.
    #[must_use]
    pub const fn frame_size_for(size: usize) -> usize {
        FreelistScheme::<P, ALIGN>::frame_size_for(size)
    }

    /// Binds the allocator to `base..base + size` as a single free block and
    /// resets the counters. Allocations of a previous mapping are unregistered
    /// and forgotten.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads and writes, must not be used by
    /// anything else while mapped, and must outlive every allocation made from
    /// it.
    pub unsafe fn map(
        &self,
        base: NonNull<u8>,
        size: usize,
        name: &str,
    ) -> Result<(), AllocError> {
        unsafe { self.scheme.lock().map(base, size, name) }
    }

    /// Allocates `size` bytes from the first free block large enough.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.scheme.lock().allocate(size, None, Location::caller())
    }

    /// Like [`Self::allocate`], recording `description` with the tracking
    /// policy.
    #[track_caller]
    pub fn allocate_with(&self, size: usize, description: &str) -> Result<NonNull<u8>, AllocError> {
        self.scheme
            .lock()
            .allocate(size, Some(description), Location::caller())
    }

    /// Returns an allocation to the free list, merging it with adjacent free
    /// blocks.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator. Double frees and
    /// stale pointers inside the region are not detected.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut scheme = self.scheme.lock();
        let block = scheme.checked_header(ptr)?;
        unsafe {
            scheme.release(block);
        }
        Ok(())
    }

    /// Moves the allocation at `ptr` into a new `new_size`-byte block, copying
    /// as much of the payload as fits, and frees the old block.
    ///
    /// On error the old allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        self.scheme
            .lock()
            .reallocate(ptr, new_size, Location::caller())
    }

    /// Turns the whole region back into one free block, unregistering every
    /// live allocation.
    pub fn free_all(&self) {
        self.scheme.lock().free_all();
    }

    /// Moves `value` into a fresh block.
    #[track_caller]
    pub fn allocate_value<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        region::check_value_layout::<T>(ALIGN, usize::MAX)?;
        let data = self.scheme.lock().allocate(
            mem::size_of::<T>(),
            Some(any::type_name::<T>()),
            Location::caller(),
        )?;
        let ptr = data.cast::<T>();
        unsafe {
            ptr.write(value);
        }
        Ok(ptr)
    }

    /// Drops the value at `ptr` and frees its block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Self::allocate_value`] on this allocator and
    /// must not have been freed.
    pub unsafe fn free_value<T>(&self, ptr: NonNull<T>) -> Result<(), AllocError> {
        let value = {
            let mut scheme = self.scheme.lock();
            let block = scheme.checked_header(ptr.cast())?;
            let value = unsafe { ptr.read() };
            unsafe {
                scheme.release(block);
            }
            value
        };
        mem::drop(value);
        Ok(())
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.scheme.lock().region.used_bytes()
    }

    /// Number of successful allocations since the last [`Self::map`].
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.scheme.lock().allocation_count
    }

    /// Number of frees since the last [`Self::map`].
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.scheme.lock().free_count
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.scheme.lock().free_block_count()
    }

    /// Largest payload a single allocation could currently get.
    #[must_use]
    pub fn largest_free_capacity(&self) -> usize {
        self.scheme.lock().largest_free_capacity()
    }
}

impl<P, const ALIGN: usize> RegionInspect for FreelistAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    fn info(&self) -> RegionInfo {
        self.scheme.lock().region.info()
    }

    fn snapshot(&self, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError> {
        self.scheme.lock().snapshot(out)
    }
}
