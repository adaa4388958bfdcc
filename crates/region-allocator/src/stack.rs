//! LIFO bump allocator.
//!
//! A marker points at the next free byte of the region. Allocating carves a
//! frame at the marker and bumps it; freeing is only allowed for the most
//! recently allocated live frame and retracts the marker by that frame's size.
//!
//! ```text
//! Stack Layout:
//! ┌────────────────────┬────────────────────┬─────────────────────────────┐
//! │ frame 0            │ frame 1            │ free                        │
//! │ pad|header|payload │ pad|header|payload │                             │
//! └────────────────────┴────────────────────┴─────────────────────────────┘
//! ▲                                         ▲                             ▲
//! base                                      marker                        end
//! ```
//!
//! [`StackAllocator::reallocate`] never reclaims the old frame. It suits
//! transient arenas that are later reset with [`StackAllocator::free_all`].

use core::{
    any, fmt, mem,
    panic::Location,
    ptr::{self, NonNull},
};

use arrayvec::ArrayString;
use spin::mutex::SpinMutex;
use tracing::{debug, error, trace};

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

pub(crate) struct StackScheme<P: TrackingPolicy, const ALIGN: usize> {
    region: Region<VariableSize, P::Header>,
    marker: *mut u8,
    policy: P,
}

unsafe impl<P: TrackingPolicy + Send, const ALIGN: usize> Send for StackScheme<P, ALIGN> {}

impl<P, const ALIGN: usize> StackScheme<P, ALIGN>
where
    P: TrackingPolicy,
{
    const HEADER_SIZE: usize = Header::<P>::padded_size(ALIGN);

    pub(crate) const fn new(policy: P) -> Self {
        const { assert!(ALIGN.is_power_of_two()) };
        Self {
            region: Region::new(),
            marker: ptr::null_mut(),
            policy,
        }
    }

    /// Frame size needed to hold `size` payload bytes.
    pub(crate) const fn frame_size_for(size: usize) -> usize {
        size.saturating_add(ALIGN + Self::HEADER_SIZE)
    }

    /// # Safety
    ///
    /// `base..base + size` must be valid for reads and writes and exclusively
    /// owned by this scheme until it is remapped.
    pub(crate) unsafe fn map(&mut self, base: NonNull<u8>, size: usize, name: &str) {
        self.region.unregister_all(&self.policy);
        self.region.bind(base.as_ptr(), size, name);
        self.marker = base.as_ptr();
        debug!(
            region = name,
            base = base.as_ptr().addr(),
            size,
            "stack mapped"
        );
    }

    pub(crate) fn remaining_bytes(&self) -> usize {
        self.region.end_addr() - self.marker.addr()
    }

    pub(crate) fn allocate(
        &mut self,
        size: usize,
        description: Option<&str>,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        let frame_size = Self::frame_size_for(size);
        let available = self.remaining_bytes();
        if frame_size > available {
            return Err(AllocErrorKind::OutOfMemory {
                requested: frame_size,
                available,
            }
            .into());
        }

        let frame_start = self.marker;
        let header = align_ptr(frame_start, ALIGN).cast::<Header<P>>();
        let adjustment = header.addr() - frame_start.addr();
        let data = unsafe {
            AllocHeader::init_frame(header, frame_size, adjustment, P::Header::default());
            self.region.push_allocation(header);
            self.marker = frame_start.add(frame_size);
            AllocHeader::data(header, Self::HEADER_SIZE)
        };
        self.region.add_used(frame_size);
        unsafe {
            header::zero_fill(data, self.marker.addr() - data.addr());
        }

        let tracking = self.policy.register(&AllocationRecord {
            address: data.addr(),
            size,
            description,
            location,
        });
        unsafe {
            AllocHeader::set_tracking(header, tracking);
        }

        trace!(
            region = self.region.name(),
            address = data.addr(),
            size,
            frame_size,
            "stack allocate"
        );
        // the marker of a mapped region is never null
        Ok(unsafe { NonNull::new_unchecked(data) })
    }

    /// Recovers the header of `data` and checks that its frame is the top of
    /// the stack.
    pub(crate) fn checked_header(&self, data: NonNull<u8>) -> Result<*mut Header<P>, AllocError> {
        let header = self.region.header_of(data.as_ptr(), Self::HEADER_SIZE)?;
        let (frame_start, frame_size) = unsafe {
            (
                AllocHeader::frame_start(header).addr(),
                AllocHeader::frame_size(header),
            )
        };
        if self.marker.addr().checked_sub(frame_size) != Some(frame_start) {
            let top = self.region.allocations().next();
            let expected = top.map_or_else(
                || self.marker.addr(),
                |top| unsafe { AllocHeader::frame_start(top).addr() },
            );
            error!(
                region = self.region.name(),
                frame_start,
                expected,
                "stack frames must be freed in reverse allocation order"
            );
            return Err(AllocErrorKind::InvalidFreeOrder {
                frame_start,
                expected,
            }
            .into());
        }
        Ok(header)
    }

    /// # Safety
    ///
    /// `header` must be the top frame, as returned by [`Self::checked_header`].
    pub(crate) unsafe fn release(&mut self, header: *mut Header<P>) {
        let frame_size = unsafe {
            self.policy.unregister(AllocHeader::tracking(header));
            self.region.remove_allocation(header);
            self.marker = AllocHeader::frame_start(header);
            AllocHeader::frame_size(header)
        };
        self.region.sub_used(frame_size);
        unsafe {
            header::zero_fill(self.marker, frame_size);
        }
        trace!(
            region = self.region.name(),
            frame_start = self.marker.addr(),
            frame_size,
            "stack free"
        );
    }

    /// Carves a new frame at the top and copies the old payload into it. The
    /// old frame stays live.
    pub(crate) fn reallocate(
        &mut self,
        data: NonNull<u8>,
        new_size: usize,
        location: &'static Location<'static>,
    ) -> Result<NonNull<u8>, AllocError> {
        let header = self.region.header_of(data.as_ptr(), Self::HEADER_SIZE)?;
        let (old_capacity, tracking) = unsafe {
            (
                AllocHeader::frame_end(header).addr() - data.as_ptr().addr(),
                AllocHeader::tracking(header),
            )
        };
        let mut description = ArrayString::<DESCRIPTION_CAPACITY>::new();
        self.policy.describe(tracking, &mut description);
        let description = (!description.is_empty()).then_some(description.as_str());

        let new_data = self.allocate(new_size, description, location)?;
        let len = old_capacity.min(new_size);
        unsafe {
            header::copy_payload(data.as_ptr(), new_data.as_ptr(), len);
        }
        Ok(new_data)
    }

    pub(crate) fn free_all(&mut self) {
        self.region.unregister_all(&self.policy);
        self.region.clear_allocations();
        unsafe {
            header::zero_fill(self.region.base(), self.region.size());
        }
        self.marker = self.region.base();
        debug!(region = self.region.name(), "stack cleared");
    }

    pub(crate) fn snapshot(&self, out: &mut [DebugMemoryBlock]) -> Result<usize, AllocError> {
        self.region.snapshot(&self.policy, 0, out)
    }
}

/// A locked LIFO bump allocator.
///
/// `P` selects the tracking policy and `ALIGN` the alignment of every data
/// pointer handed out.
pub struct StackAllocator<P = NoTracking, const ALIGN: usize = DEFAULT_ALIGNMENT>
where
    P: TrackingPolicy,
{
    scheme: SpinMutex<StackScheme<P, ALIGN>>,
}

impl<P, const ALIGN: usize> fmt::Debug for StackAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.scheme.lock();
        f.debug_struct("StackAllocator")
            .field("info", &scheme.region.info())
            .field("remaining_bytes", &scheme.remaining_bytes())
            .finish()
    }
}

impl<P, const ALIGN: usize> Default for StackAllocator<P, ALIGN>
where
    P: TrackingPolicy + Default,
{
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P, const ALIGN: usize> StackAllocator<P, ALIGN>
where
    P: TrackingPolicy,
{
    /// Creates an unmapped stack.
    #[must_use]
    pub const fn new(policy: P) -> Self {
        Self {
            scheme: SpinMutex::new(StackScheme::new(policy)),
        }
    }

    /// Bytes of region a `size`-byte allocation consumes.
    #[must_use]
    pub const fn frame_size_for(size: usize) -> usize {
        StackScheme::<P, ALIGN>::frame_size_for(size)
    }

    /// Binds the stack to `base..base + size` with the marker at `base`.
    /// Allocations of a previous mapping are unregistered and forgotten.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads and writes, must not be used by
    /// anything else while mapped, and must outlive every allocation made from
    /// it.
    pub unsafe fn map(&self, base: NonNull<u8>, size: usize, name: &str) {
        unsafe { self.scheme.lock().map(base, size, name) }
    }

    /// Carves a frame holding `size` bytes at the top of the stack.
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

    /// Frees the top frame.
    ///
    /// Fails with [`InvalidFreeOrder`](AllocErrorKind::InvalidFreeOrder),
    /// leaving the stack untouched, if `ptr` is not the most recent live
    /// allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this stack.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut scheme = self.scheme.lock();
        let header = scheme.checked_header(ptr)?;
        unsafe {
            scheme.release(header);
        }
        Ok(())
    }

    /// Copies the allocation at `ptr` into a new `new_size`-byte frame at the
    /// top of the stack.
    ///
    /// The old frame is not reclaimed and stays live: it is released by
    /// [`Self::free_all`] or once every frame above it has been freed.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this stack.
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

    /// Resets the marker to the base, unregistering every live allocation.
    pub fn free_all(&self) {
        self.scheme.lock().free_all();
    }

    /// Moves `value` into a fresh frame.
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

    /// Drops the value at `ptr` and frees its frame, which must be the top
    /// frame. On error the value is left in place.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Self::allocate_value`] on this stack and must
    /// not have been freed.
    pub unsafe fn free_value<T>(&self, ptr: NonNull<T>) -> Result<(), AllocError> {
        let value = {
            let mut scheme = self.scheme.lock();
            let header = scheme.checked_header(ptr.cast())?;
            let value = unsafe { ptr.read() };
            unsafe {
                scheme.release(header);
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

    /// Bytes between the marker and the end of the region.
    #[must_use]
    pub fn remaining_bytes(&self) -> usize {
        self.scheme.lock().remaining_bytes()
    }
}

impl<P, const ALIGN: usize> RegionInspect for StackAllocator<P, ALIGN>
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
