//! Fixed-size slot allocator.
//!
//! The region is cut into `element_count` slots of `element_size` bytes each,
//! starting at the first `ALIGN`-aligned address of the buffer. Free slots
//! form a singly linked chain through their headers' `next` field; live slots
//! are linked in the region's all-allocations list instead.
//!
//! ```text
//! Pool Layout:
//! ┌───────┬──────────────────┬──────────────────┬─────┬──────────────────┬──────┐
//! │ pad   │ slot 0           │ slot 1           │ ... │ slot n-1         │ tail │
//! │       │ header | payload │ header | payload │     │ header | payload │      │
//! └───────┴──────────────────┴──────────────────┴─────┴──────────────────┴──────┘
//! ```
//!
//! Allocation pops the head of the free chain and freeing pushes the slot
//! back, so the most recently freed slot is the next one handed out. Both
//! are O(1).

use core::{
    any, fmt, mem,
    panic::Location,
    ptr::{self, NonNull},
};

use spin::mutex::SpinMutex;
use tracing::{debug, trace};

use crate::{
    align::align_up,
    config::DEFAULT_ALIGNMENT,
    debug::{DebugMemoryBlock, RegionInfo, RegionInspect},
    error::{AllocError, AllocErrorKind},
    header::{self, AllocHeader, FixedSize, FixedSizeHeader},
    region::{self, Region},
    tracking::{AllocationRecord, NoTracking, TrackingPolicy},
};

type Header<P> = FixedSizeHeader<<P as TrackingPolicy>::Header>;

pub(crate) struct PoolScheme<P: TrackingPolicy, const ALIGN: usize> {
    region: Region<FixedSize, P::Header>,
    payload_size: usize,
    slots: *mut u8,
    element_count: usize,
    free_slots: usize,
    next_free_slot: *mut Header<P>,
    policy: P,
}

unsafe impl<P: TrackingPolicy + Send, const ALIGN: usize> Send for PoolScheme<P, ALIGN> {}

impl<P, const ALIGN: usize> PoolScheme<P, ALIGN>
where
    P: TrackingPolicy,
{
    const HEADER_SIZE: usize = Header::<P>::padded_size(ALIGN);

    pub(crate) const fn new(policy: P, payload_size: usize) -> Self {
        const { assert!(ALIGN.is_power_of_two()) };
        let payload_size = if payload_size == 0 { 1 } else { payload_size };
        Self {
            region: Region::new(),
            payload_size,
            slots: ptr::null_mut(),
            element_count: 0,
            free_slots: 0,
            next_free_slot: ptr::null_mut(),
            policy,
        }
    }

    /// Payload capacity of a slot.
    fn slot_capacity(&self) -> usize {
        align_up(self.payload_size, ALIGN)
    }

    pub(crate) fn element_size(&self) -> usize {
        self.slot_capacity() + Self::HEADER_SIZE
    }

    /// # Safety
    ///
    /// `base..base + size` must be valid for reads and writes and exclusively
    /// owned by this scheme until it is unmapped or remapped.
    pub(crate) unsafe fn map(
        &mut self,
        base: NonNull<u8>,
        size: usize,
        name: &str,
    ) -> Result<(), AllocError> {
        let element_size = self.element_size();
        let offset = base.as_ptr().align_offset(ALIGN);
        let element_count = size.saturating_sub(offset) / element_size;
        if element_count == 0 {
            return Err(AllocErrorKind::RegionTooSmall {
                size,
                required: offset.saturating_add(element_size),
            }
            .into());
        }

        self.region.unregister_all(&self.policy);
        self.region.bind(base.as_ptr(), size, name);
        self.slots = unsafe { base.as_ptr().add(offset) };
        self.element_count = element_count;
        self.rebuild_free_chain();
        debug!(
            region = name,
            base = base.as_ptr().addr(),
            size,
            element_size,
            element_count,
            "pool mapped"
        );
        Ok(())
    }

    pub(crate) fn unmap(&mut self) {
        self.region.unregister_all(&self.policy);
        self.region.unbind();
        self.slots = ptr::null_mut();
        self.element_count = 0;
        self.free_slots = 0;
        self.next_free_slot = ptr::null_mut();
    }

    fn slot(&self, index: usize) -> *mut Header<P> {
        unsafe { self.slots.add(index * self.element_size()).cast::<Header<P>>() }
    }

    /// Links every slot, in address order, into the free chain.
    fn rebuild_free_chain(&mut self) {
        let mut next = ptr::null_mut();
        for index in (0..self.element_count).rev() {
            let slot = self.slot(index);
            unsafe {
                AllocHeader::init(slot, FixedSize, P::Header::default());
                AllocHeader::set_next(slot, next);
            }
            next = slot;
        }
        self.next_free_slot = next;
        self.free_slots = self.element_count;
    }

    pub(crate) fn allocate(
        &mut self,
        description: Option<&str>,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        let slot = self.next_free_slot;
        if slot.is_null() {
            return Err(AllocErrorKind::PoolExhausted {
                element_size: self.element_size(),
                element_count: self.element_count,
            }
            .into());
        }

        unsafe {
            self.next_free_slot = AllocHeader::next(slot);
            self.region.push_allocation(slot);
        }
        self.free_slots -= 1;
        self.region.add_used(self.element_size());

        let data = unsafe { AllocHeader::data(slot, Self::HEADER_SIZE) };
        unsafe {
            header::zero_fill(data, self.slot_capacity());
        }
        let tracking = self.policy.register(&AllocationRecord {
            address: data.addr(),
            size: self.payload_size,
            description,
            location,
        });
        unsafe {
            AllocHeader::set_tracking(slot, tracking);
        }

        trace!(
            region = self.region.name(),
            address = data.addr(),
            free_slots = self.free_slots,
            "pool allocate"
        );
        // slots lie inside a mapped, non-null buffer
        Ok(unsafe { NonNull::new_unchecked(data) })
    }

    /// Recovers the slot header of `data`, rejecting pointers that are not
    /// the data pointer of one of the slots.
    pub(crate) fn checked_header(&self, data: NonNull<u8>) -> Result<*mut Header<P>, AllocError> {
        let header = self.region.header_of(data.as_ptr(), Self::HEADER_SIZE)?;
        let slots_end = self.slots.addr() + self.element_count * self.element_size();
        let on_boundary = header
            .addr()
            .checked_sub(self.slots.addr())
            .is_some_and(|offset| offset % self.element_size() == 0 && header.addr() < slots_end);
        if !on_boundary {
            return Err(AllocErrorKind::ForeignPointer {
                address: data.as_ptr().addr(),
                base: self.slots.addr(),
                end: slots_end,
            }
            .into());
        }
        Ok(header)
    }

    /// # Safety
    ///
    /// `slot` must be a live slot returned by [`Self::checked_header`].
    pub(crate) unsafe fn release(&mut self, slot: *mut Header<P>) {
        unsafe {
            self.policy.unregister(AllocHeader::tracking(slot));
            AllocHeader::set_tracking(slot, P::Header::default());
            self.region.remove_allocation(slot);
            let data = AllocHeader::data(slot, Self::HEADER_SIZE);
            header::zero_fill(data, self.slot_capacity());
            AllocHeader::set_next(slot, self.next_free_slot);
        }
        self.next_free_slot = slot;
        self.free_slots += 1;
        self.region.sub_used(self.element_size());
        trace!(
            region = self.region.name(),
            address = slot.addr(),
            free_slots = self.free_slots,
            "pool free"
        );
    }

    pub(crate) fn free_all(&mut self) {
        if self.slots.is_null() {
            return;
        }
        self.region.unregister_all(&self.policy);
        self.region.clear_allocations();
        unsafe {
            header::zero_fill(self.slots, self.element_count * self.element_size());
        }
        self.rebuild_free_chain();
        debug!(region = self.region.name(), "pool cleared");
    }

    pub(crate) fn for_each_allocation<F>(&self, mut f: F)
    where
        F: FnMut(NonNull<u8>),
    {
        for slot in self.region.allocations() {
            let data = unsafe { AllocHeader::data(slot, Self::HEADER_SIZE) };
            if let Some(data) = NonNull::new(data) {
                f(data);
            }
        }
    }

    pub(crate) fn snapshot(&self, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError> {
        self.region.snapshot(&self.policy, self.element_size(), out)
    }
}

/// A locked fixed-size slot allocator.
///
/// `P` selects the tracking policy and `ALIGN` the alignment of every slot's
/// data pointer.
pub struct PoolAllocator<P = NoTracking, const ALIGN: usize = DEFAULT_ALIGNMENT>
where
    P: TrackingPolicy,
{
    scheme: SpinMutex<PoolScheme<P, ALIGN>>,
}

impl<P, const ALIGN: usize> fmt::Debug for PoolAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.scheme.lock();
        f.debug_struct("PoolAllocator")
            .field("info", &scheme.region.info())
            .field("element_size", &scheme.element_size())
            .field("element_count", &scheme.element_count)
            .field("free_slots", &scheme.free_slots)
            .finish()
    }
}

impl<P, const ALIGN: usize> PoolAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    /// Creates an unmapped pool whose slots hold `payload_size` bytes.
    ///
    /// A zero payload size is treated as one byte.
    #[must_use]
    pub const fn new(policy: P, payload_size: usize) -> Self {
        Self {
            scheme: SpinMutex::new(PoolScheme::new(policy, payload_size)),
        }
    }

    /// Binds the pool to `base..base + size` and links every slot into the
    /// free chain. Allocations of a previous mapping are unregistered and
    /// forgotten.
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

    /// Detaches the pool from its buffer, unregistering and forgetting every
    /// live allocation.
    pub fn unmap(&self) {
        self.scheme.lock().unmap();
    }

    /// Pops a free slot.
    #[track_caller]
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        self.scheme.lock().allocate(None, Location::caller())
    }

    /// Pops a free slot, recording `description` with the tracking policy.
    #[track_caller]
    pub fn allocate_with(&self, description: &str) -> Result<NonNull<u8>, AllocError> {
        self.scheme
            .lock()
            .allocate(Some(description), Location::caller())
    }

    /// Returns a slot to the head of the free chain.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool. Double frees and stale
    /// pointers are not detected.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut scheme = self.scheme.lock();
        let slot = scheme.checked_header(ptr)?;
        unsafe {
            scheme.release(slot);
        }
        Ok(())
    }

    /// Releases every slot at once.
    pub fn free_all(&self) {
        self.scheme.lock().free_all();
    }

    /// Moves `value` into a fresh slot.
    #[track_caller]
    pub fn allocate_value<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let mut scheme = self.scheme.lock();
        region::check_value_layout::<T>(ALIGN, scheme.slot_capacity())?;
        let data = scheme.allocate(Some(any::type_name::<T>()), Location::caller())?;
        let ptr = data.cast::<T>();
        unsafe {
            ptr.write(value);
        }
        Ok(ptr)
    }

    /// Drops the value at `ptr` and frees its slot.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Self::allocate_value`] on this pool and must not
    /// have been freed.
    pub unsafe fn free_value<T>(&self, ptr: NonNull<T>) -> Result<(), AllocError> {
        let value = {
            let mut scheme = self.scheme.lock();
            let slot = scheme.checked_header(ptr.cast())?;
            let value = unsafe { ptr.read() };
            unsafe {
                scheme.release(slot);
            }
            value
        };
        mem::drop(value);
        Ok(())
    }

    /// Bytes spanned by one slot, header included.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.scheme.lock().element_size()
    }

    /// Bytes of payload each slot can hold.
    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        self.scheme.lock().slot_capacity()
    }

    /// Number of slots in the mapped region; zero while unmapped.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.scheme.lock().element_count
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.scheme.lock().free_slots
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.scheme.lock().region.used_bytes()
    }

    /// Calls `f` with the data pointer of every live slot, most recent first,
    /// while holding the pool's lock.
    pub(crate) fn for_each_allocation<F>(&self, f: F)
    where
        F: FnMut(NonNull<u8>),
    {
        self.scheme.lock().for_each_allocation(f);
    }
}

impl<P, const ALIGN: usize> RegionInspect for PoolAllocator<P, ALIGN>
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
