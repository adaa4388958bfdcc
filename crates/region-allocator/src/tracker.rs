//! Storage for per-allocation debug metadata.
//!
//! An [`AllocationTracker`] is a dedicated, untracked [`PoolAllocator`] whose
//! slots hold [`DebugEntry`] records, plus a live-allocation counter. The
//! process-wide instance is reached through [`global`], initialized with
//! [`init_global`] and torn down with [`shutdown_global`]; any other instance
//! can be injected into [`DefaultTracking::new`](crate::tracking::DefaultTracking::new).
//!
//! Lock order is always "scheme, then tracker": schemes call into the tracker
//! while holding their own lock, and the tracker's pool never calls back.

use core::{
    fmt::{self, Write as _},
    mem,
    panic::Location,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use arrayvec::ArrayString;
use tracing::{debug, warn};

use crate::{
    config::{DESCRIPTION_CAPACITY, STACK_TRACE_CAPACITY, TRACKING_ALIGNMENT},
    error::AllocError,
    pool::PoolAllocator,
    tracking::{AllocationRecord, NoTracking},
};

/// Debug metadata recorded for one live tracked allocation.
#[derive(Clone)]
pub struct DebugEntry {
    address: usize,
    size_in_bytes: usize,
    description: ArrayString<DESCRIPTION_CAPACITY>,
    stack_trace: ArrayString<STACK_TRACE_CAPACITY>,
}

const _: () = assert!(mem::align_of::<DebugEntry>() <= TRACKING_ALIGNMENT);

impl fmt::Debug for DebugEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugEntry")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size_in_bytes", &self.size_in_bytes)
            .field("description", &self.description.as_str())
            .finish_non_exhaustive()
    }
}

impl DebugEntry {
    fn new(record: &AllocationRecord<'_>) -> Self {
        let mut entry = Self {
            address: record.address,
            size_in_bytes: record.size,
            description: ArrayString::new(),
            stack_trace: ArrayString::new(),
        };
        let description = record.description.unwrap_or_default();
        push_truncated(&mut entry.description, description);
        capture_stack_trace(record.location, &mut entry.stack_trace);
        entry
    }

    /// Address of the tracked allocation's data.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Requested payload size of the tracked allocation.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Where the allocation was requested from.
    #[must_use]
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }
}

/// Pool of [`DebugEntry`] records plus the live-allocation counter.
pub struct AllocationTracker {
    pool: PoolAllocator<NoTracking, TRACKING_ALIGNMENT>,
    live_allocations: AtomicUsize,
    missing_entries: AtomicUsize,
}

impl fmt::Debug for AllocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTracker")
            .field("live_allocations", &self.live_allocations())
            .field("missing_entries", &self.missing_entries())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationTracker {
    /// Creates a tracker with no storage. Allocations registered before
    /// [`init`](Self::init) are counted but get no [`DebugEntry`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pool: PoolAllocator::new(NoTracking, mem::size_of::<DebugEntry>()),
            live_allocations: AtomicUsize::new(0),
            missing_entries: AtomicUsize::new(0),
        }
    }

    /// Binds the tracker's pool to `base..base + size`.
    ///
    /// # Safety
    ///
    /// The buffer must be valid for reads and writes, must not be used by
    /// anything else, and must outlive every allocation tracked by `self`.
    pub unsafe fn init(&self, base: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        unsafe {
            self.pool.map(base, size, "tracking")?;
        }
        debug!(
            size,
            capacity = self.capacity(),
            "allocation tracker initialized"
        );
        Ok(())
    }

    /// Drops every entry and detaches the tracker from its buffer.
    ///
    /// Allocations still tracked by `self` lose their entries; shut down only
    /// after the tracked regions are released.
    pub fn shutdown(&self) {
        self.pool.free_all();
        self.pool.unmap();
        self.live_allocations.store(0, Ordering::Release);
        self.missing_entries.store(0, Ordering::Release);
        debug!("allocation tracker shut down");
    }

    /// Number of allocations registered and not yet unregistered.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    /// Number of registrations that got no entry because the pool was full.
    #[must_use]
    pub fn missing_entries(&self) -> usize {
        self.missing_entries.load(Ordering::Acquire)
    }

    /// Maximum number of simultaneously stored entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.element_count()
    }

    /// Calls `f` for every stored entry, most recent first.
    ///
    /// The tracker's lock is held during the walk: `f` must not allocate from
    /// a region tracked by `self`.
    pub fn for_each_entry<F>(&self, mut f: F)
    where
        F: FnMut(&DebugEntry),
    {
        self.pool.for_each_allocation(|data| {
            let entry = unsafe { data.cast::<DebugEntry>().as_ref() };
            f(entry);
        });
    }

    pub(crate) fn track(&self, record: &AllocationRecord<'_>) -> *mut DebugEntry {
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        match self.pool.allocate() {
            Ok(slot) => {
                let entry = slot.cast::<DebugEntry>();
                unsafe {
                    entry.write(DebugEntry::new(record));
                }
                entry.as_ptr()
            }
            Err(err) => {
                self.missing_entries.fetch_add(1, Ordering::AcqRel);
                warn!(
                    address = record.address,
                    size = record.size,
                    %err,
                    "no room for debug entry"
                );
                ptr::null_mut()
            }
        }
    }

    /// # Safety
    ///
    /// `entry` must be null or a pointer returned by [`Self::track`] that has
    /// not been untracked yet.
    pub(crate) unsafe fn untrack(&self, entry: *mut DebugEntry) {
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
        let Some(entry) = NonNull::new(entry) else {
            return;
        };
        unsafe {
            entry.drop_in_place();
            if let Err(err) = self.pool.free(entry.cast()) {
                warn!(%err, "failed to release debug entry");
            }
        }
    }
}

static GLOBAL_TRACKER: AllocationTracker = AllocationTracker::new();

/// Returns the process-wide tracker.
#[must_use]
pub fn global() -> &'static AllocationTracker {
    &GLOBAL_TRACKER
}

/// Initializes the process-wide tracker with a dedicated buffer.
///
/// The buffer is typically [`TRACKING_POOL_SIZE`](crate::config::TRACKING_POOL_SIZE)
/// bytes.
///
/// # Safety
///
/// Same contract as [`AllocationTracker::init`], with a `'static` buffer.
pub unsafe fn init_global(base: NonNull<u8>, size: usize) -> Result<(), AllocError> {
    unsafe { GLOBAL_TRACKER.init(base, size) }
}

/// Shuts the process-wide tracker down.
pub fn shutdown_global() {
    GLOBAL_TRACKER.shutdown();
}

/// Appends as much of `text` as fits into `buf`, cutting at a char boundary.
pub(crate) fn push_truncated<const CAP: usize>(buf: &mut ArrayString<CAP>, text: &str) {
    let mut end = text.len().min(buf.remaining_capacity());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&text[..end]);
}

struct Truncating<'a, const CAP: usize>(&'a mut ArrayString<CAP>);

impl<const CAP: usize> fmt::Write for Truncating<'_, CAP> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        push_truncated(self.0, s);
        Ok(())
    }
}

fn capture_stack_trace(location: &Location<'_>, out: &mut ArrayString<STACK_TRACE_CAPACITY>) {
    let mut out = Truncating(out);
    let _ = write!(out, "at {location}");
    #[cfg(feature = "backtrace")]
    {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let _ = write!(out, "\n{backtrace}");
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::{string::String, vec::Vec};
    use core::iter;

    use super::*;
    use crate::config::kib;

    fn record(description: Option<&str>) -> AllocationRecord<'_> {
        AllocationRecord {
            address: 0x1000,
            size: 24,
            description,
            location: Location::caller(),
        }
    }

    fn with_tracker<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&AllocationTracker),
    {
        let mut buf = alloc::vec![0_u64; size / 8];
        let tracker = AllocationTracker::new();
        unsafe {
            tracker
                .init(NonNull::new(buf.as_mut_ptr().cast()).unwrap(), size)
                .unwrap();
        }
        test_fn(&tracker);
        tracker.shutdown();
    }

    #[test]
    fn test_push_truncated_respects_char_boundaries() {
        let mut buf = ArrayString::<4>::new();
        push_truncated(&mut buf, "ab\u{00e9}z");
        assert_eq!(buf.as_str(), "ab\u{00e9}");

        let mut buf = ArrayString::<3>::new();
        push_truncated(&mut buf, "ab\u{00e9}");
        assert_eq!(buf.as_str(), "ab");
    }

    #[test]
    fn test_track_and_untrack() {
        with_tracker(kib(64), |tracker| {
            let entry = tracker.track(&record(Some("mesh")));
            assert!(!entry.is_null());
            assert_eq!(tracker.live_allocations(), 1);

            let mut seen = Vec::new();
            tracker.for_each_entry(|entry| {
                let description = String::from(entry.description());
                let size = entry.size_in_bytes();
                seen.push((entry.address(), size, description));
                assert!(entry.stack_trace().starts_with("at "));
                assert!(entry.stack_trace().contains(file!()));
            });
            assert_eq!(seen, [(0x1000, 24, String::from("mesh"))]);

            unsafe {
                tracker.untrack(entry);
            }
            assert_eq!(tracker.live_allocations(), 0);
            let mut count = 0;
            tracker.for_each_entry(|_| count += 1);
            assert_eq!(count, 0);
        });
    }

    #[test]
    fn test_exhausted_pool_still_counts() {
        let slot = mem::size_of::<DebugEntry>().next_multiple_of(TRACKING_ALIGNMENT) + 64;
        let size = (slot * 2).next_multiple_of(8) + TRACKING_ALIGNMENT;
        with_tracker(size, |tracker| {
            let capacity = tracker.capacity();
            assert!(capacity >= 1);
            let entries: Vec<_> = iter::repeat_with(|| tracker.track(&record(None)))
                .take(capacity)
                .collect();
            assert!(entries.iter().all(|entry| !entry.is_null()));

            let overflow = tracker.track(&record(None));
            assert!(overflow.is_null());
            assert_eq!(tracker.live_allocations(), capacity + 1);
            assert_eq!(tracker.missing_entries(), 1);

            unsafe {
                tracker.untrack(overflow);
                for entry in entries {
                    tracker.untrack(entry);
                }
            }
            assert_eq!(tracker.live_allocations(), 0);
        });
    }

    #[test]
    fn test_uninitialized_tracker_counts_without_entries() {
        let tracker = AllocationTracker::new();
        assert_eq!(tracker.capacity(), 0);
        let entry = tracker.track(&record(Some("early")));
        assert!(entry.is_null());
        assert_eq!(tracker.live_allocations(), 1);
        unsafe {
            tracker.untrack(entry);
        }
        assert_eq!(tracker.live_allocations(), 0);
    }
}
