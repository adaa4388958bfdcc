//! Tracking policies decide, at compile time, what every allocation header
//! carries besides its links and what happens when an allocation is created
//! or released.
//!
//! - [`NoTracking`] adds nothing to the header and does nothing on
//!   register/unregister.
//! - [`DefaultTracking`] records a [`DebugEntry`] per live allocation in an
//!   [`AllocationTracker`] and keeps a pointer to it in the header.
//!
//! The policy is a type parameter of every scheme, so the untracked case is
//! monomorphized down to plain list manipulation.

use core::{fmt, panic::Location, ptr};

use arrayvec::ArrayString;

use crate::tracker::{self, AllocationTracker, DebugEntry, push_truncated};

/// What a scheme knows about an allocation when it registers it.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord<'a> {
    /// Address of the data handed to the caller.
    pub address: usize,
    /// Requested payload size in bytes.
    pub size: usize,
    pub description: Option<&'a str>,
    /// Call site of the public allocation entry point.
    pub location: &'static Location<'static>,
}

/// A compile-time tracking strategy.
pub trait TrackingPolicy {
    /// Extra field embedded in every allocation header.
    type Header: Copy + Default;

    /// Called after an allocation is carved; the result is stored in the
    /// allocation's header.
    fn register(&self, record: &AllocationRecord<'_>) -> Self::Header;

    /// Called before an allocation is released, with the value `register`
    /// returned for it.
    fn unregister(&self, header: Self::Header);

    /// Appends as much of the allocation's description as fits to `out`.
    fn describe<const CAP: usize>(&self, header: Self::Header, out: &mut ArrayString<CAP>) {
        let _ = (header, out);
    }
}

/// Header extension of untracked allocations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UntrackedHeader;

/// Header extension of tracked allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedHeader {
    debug_info: *mut DebugEntry,
}

impl Default for TrackedHeader {
    fn default() -> Self {
        Self {
            debug_info: ptr::null_mut(),
        }
    }
}

impl TrackedHeader {
    /// Returns `true` if a debug entry was recorded for the allocation.
    ///
    /// It is `false` when the tracking pool was full or not initialized.
    #[must_use]
    pub fn has_debug_entry(&self) -> bool {
        !self.debug_info.is_null()
    }
}

/// Policy that records nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoTracking;

impl TrackingPolicy for NoTracking {
    type Header = UntrackedHeader;

    #[inline]
    fn register(&self, _record: &AllocationRecord<'_>) -> Self::Header {
        UntrackedHeader
    }

    #[inline]
    fn unregister(&self, _header: Self::Header) {}
}

/// Policy that records a [`DebugEntry`] for every live allocation.
///
/// [`DefaultTracking::global`] uses the process-wide tracker; tests and
/// embedders can pass their own [`AllocationTracker`] to
/// [`DefaultTracking::new`].
#[derive(Clone, Copy)]
pub struct DefaultTracking<'t> {
    tracker: &'t AllocationTracker,
}

impl fmt::Debug for DefaultTracking<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTracking")
            .field("tracker", self.tracker)
            .finish()
    }
}

impl<'t> DefaultTracking<'t> {
    #[must_use]
    pub const fn new(tracker: &'t AllocationTracker) -> Self {
        Self { tracker }
    }

    #[must_use]
    pub fn tracker(&self) -> &'t AllocationTracker {
        self.tracker
    }
}

impl DefaultTracking<'static> {
    /// Returns a policy bound to the process-wide tracker.
    #[must_use]
    pub fn global() -> Self {
        Self::new(tracker::global())
    }
}

impl Default for DefaultTracking<'static> {
    fn default() -> Self {
        Self::global()
    }
}

impl TrackingPolicy for DefaultTracking<'_> {
    type Header = TrackedHeader;

    fn register(&self, record: &AllocationRecord<'_>) -> Self::Header {
        TrackedHeader {
            debug_info: self.tracker.track(record),
        }
    }

    fn unregister(&self, header: Self::Header) {
        unsafe {
            self.tracker.untrack(header.debug_info);
        }
    }

    fn describe<const CAP: usize>(&self, header: Self::Header, out: &mut ArrayString<CAP>) {
        if header.debug_info.is_null() {
            return;
        }
        // entries live until the allocation owning them is unregistered
        let entry = unsafe { &*header.debug_info };
        push_truncated(out, entry.description());
    }
}
