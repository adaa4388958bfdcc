//! Bookkeeping shared by every scheme: the bound buffer, the number of bytes
//! in use, and the tail of the all-allocations list.

use core::{iter, mem, ptr};

use arrayvec::ArrayString;

use crate::{
    config::REGION_NAME_CAPACITY,
    debug::{DebugMemoryBlock, RegionInfo},
    error::{AllocError, AllocErrorKind},
    header::{AllocHeader, SizeClass},
    tracker::push_truncated,
    tracking::TrackingPolicy,
};

pub(crate) struct Region<S, T> {
    name: ArrayString<REGION_NAME_CAPACITY>,
    base: *mut u8,
    size: usize,
    used_bytes: usize,
    last_alloc: *mut AllocHeader<S, T>,
}

impl<S, T> Region<S, T>
where
    S: SizeClass,
    T: Copy + Default,
{
    pub(crate) const fn new() -> Self {
        Self {
            name: ArrayString::new_const(),
            base: ptr::null_mut(),
            size: 0,
            used_bytes: 0,
            last_alloc: ptr::null_mut(),
        }
    }

    /// Binds the region to `base..base + size`, forgetting any previous state.
    pub(crate) fn bind(&mut self, base: *mut u8, size: usize, name: &str) {
        self.name.clear();
        push_truncated(&mut self.name, name);
        self.base = base;
        self.size = size;
        self.used_bytes = 0;
        self.last_alloc = ptr::null_mut();
    }

    pub(crate) fn unbind(&mut self) {
        self.bind(ptr::null_mut(), 0, "");
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn end_addr(&self) -> usize {
        self.base.addr() + self.size
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub(crate) fn add_used(&mut self, bytes: usize) {
        self.used_bytes += bytes;
    }

    pub(crate) fn sub_used(&mut self, bytes: usize) {
        assert!(self.used_bytes >= bytes, "used bytes underflow");
        self.used_bytes -= bytes;
    }

    /// Recovers the header of `data`, rejecting pointers whose header would
    /// lie outside the bound buffer.
    pub(crate) fn header_of(
        &self,
        data: *mut u8,
        header_size: usize,
    ) -> Result<*mut AllocHeader<S, T>, AllocError> {
        let inside = data
            .addr()
            .checked_sub(header_size)
            .is_some_and(|header| header >= self.base.addr() && data.addr() <= self.end_addr());
        if self.base.is_null() || !inside {
            return Err(AllocErrorKind::ForeignPointer {
                address: data.addr(),
                base: self.base.addr(),
                end: self.end_addr(),
            }
            .into());
        }
        Ok(unsafe { AllocHeader::from_data(data, header_size) })
    }

    /// Appends a live allocation to the all-allocations list.
    ///
    /// # Safety
    ///
    /// `header` must be an initialized header inside this region that is not
    /// linked in any list.
    pub(crate) unsafe fn push_allocation(&mut self, header: *mut AllocHeader<S, T>) {
        unsafe { AllocHeader::push_back(&mut self.last_alloc, header) }
    }

    /// Removes a live allocation from the all-allocations list.
    ///
    /// # Safety
    ///
    /// `header` must be linked in this region's all-allocations list.
    pub(crate) unsafe fn remove_allocation(&mut self, header: *mut AllocHeader<S, T>) {
        unsafe { AllocHeader::unlink(None, Some(&mut self.last_alloc), header) }
    }

    pub(crate) fn clear_allocations(&mut self) {
        self.last_alloc = ptr::null_mut();
        self.used_bytes = 0;
    }

    /// Iterates over live allocation headers, most recent first.
    pub(crate) fn allocations(&self) -> impl Iterator<Item = *mut AllocHeader<S, T>> {
        // every node reachable from `last_alloc` is an initialized header
        let last = (!self.last_alloc.is_null()).then_some(self.last_alloc);
        iter::successors(last, |&header| {
            let prev = unsafe { AllocHeader::prev(header) };
            (!prev.is_null()).then_some(prev)
        })
    }

    /// Unregisters every live allocation from `policy`.
    ///
    /// The allocations stay linked; only their tracking fields are reset.
    pub(crate) fn unregister_all<P>(&self, policy: &P)
    where
        P: TrackingPolicy<Header = T>,
    {
        for header in self.allocations() {
            unsafe {
                policy.unregister(AllocHeader::tracking(header));
                AllocHeader::set_tracking(header, T::default());
            }
        }
    }

    /// Fills `out` with one block per live allocation, most recent first.
    pub(crate) fn snapshot<P>(
        &self,
        policy: &P,
        slot_size: usize,
        out: &mut [DebugMemoryBlock],
    ) -> Result<usize, AllocError>
    where
        P: TrackingPolicy<Header = T>,
    {
        let capacity = out.len();
        let mut count = 0;
        for header in self.allocations() {
            let Some(block) = out.get_mut(count) else {
                return Err(AllocErrorKind::SnapshotOverflow { capacity }.into());
            };
            let (frame_address, frame_size) = unsafe { S::frame_span(header, slot_size) };
            *block = DebugMemoryBlock {
                frame_address,
                frame_size,
                description: ArrayString::new(),
                is_allocated: true,
            };
            let tracking = unsafe { AllocHeader::tracking(header) };
            policy.describe(tracking, &mut block.description);
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            name: self.name,
            base_address: self.base.addr(),
            size_in_bytes: self.size,
            used_bytes: self.used_bytes,
        }
    }
}

/// Checks that a `T` fits in a frame whose data is aligned to `align` and
/// holds at most `max_size` bytes.
#[track_caller]
pub(crate) fn check_value_layout<T>(align: usize, max_size: usize) -> Result<(), AllocError> {
    let (size, value_align) = (mem::size_of::<T>(), mem::align_of::<T>());
    if value_align > align || size > max_size {
        return Err(AllocErrorKind::UnsupportedLayout {
            size,
            align: value_align,
            max_size,
            max_align: align,
        }
        .into());
    }
    Ok(())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::VariableSize;

    #[test]
    fn test_header_of_rejects_out_of_range() {
        let mut buf = [0_u8; 256];
        let base = buf.as_mut_ptr();
        let mut region = Region::<VariableSize, ()>::new();
        let err = region.header_of(base.wrapping_add(64), 32).unwrap_err();
        assert!(err.kind().is_foreign_pointer());

        region.bind(base, buf.len(), "bounds");
        let header = region.header_of(base.wrapping_add(64), 32).unwrap();
        assert_eq!(header.addr(), base.addr() + 32);
        // the header would start before the region
        let err = region.header_of(base.wrapping_add(16), 32).unwrap_err();
        assert!(err.kind().is_foreign_pointer());
        let err = region.header_of(base.wrapping_add(257), 32).unwrap_err();
        assert!(err.kind().is_foreign_pointer());

        region.unbind();
        let err = region.header_of(base.wrapping_add(64), 32).unwrap_err();
        assert!(err.kind().is_foreign_pointer());
    }

    #[test]
    fn test_name_is_truncated() {
        let mut region = Region::<VariableSize, ()>::new();
        let long = "x".repeat(REGION_NAME_CAPACITY * 2);
        region.bind(ptr::null_mut(), 0, &long);
        assert_eq!(region.name().len(), REGION_NAME_CAPACITY);
    }

    #[test]
    fn test_check_value_layout() {
        #[expect(dead_code)]
        #[repr(align(16))]
        struct Aligned([u8; 16]);

        check_value_layout::<u64>(8, 8).unwrap();

        let err = check_value_layout::<Aligned>(8, 64).unwrap_err();
        assert_eq!(
            err,
            AllocErrorKind::UnsupportedLayout {
                size: 16,
                align: 16,
                max_size: 64,
                max_align: 8,
            }
        );
        let err = check_value_layout::<[u8; 33]>(16, 32).unwrap_err();
        assert!(err.kind().is_unsupported_layout());
    }
}
