//! Compile-time configuration.

/// Alignment used by the schemes when no `ALIGN` parameter is given.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Byte budget dedicated to the tracking pool that stores
/// [`DebugEntry`](crate::tracker::DebugEntry) records.
pub const TRACKING_POOL_SIZE: usize = mib(32);

/// Alignment of the tracking pool's slots.
pub const TRACKING_ALIGNMENT: usize = 16;

/// Capacity of the description stored in a debug entry.
pub const DESCRIPTION_CAPACITY: usize = 128;

/// Capacity of the captured stack trace stored in a debug entry.
pub const STACK_TRACE_CAPACITY: usize = 2048;

/// Capacity of the description copied into a snapshot block.
pub const SNAPSHOT_DESCRIPTION_CAPACITY: usize = 64;

/// Capacity of a region's name.
pub const REGION_NAME_CAPACITY: usize = 64;

#[must_use]
pub const fn kib(n: usize) -> usize {
    n * 1024
}

#[must_use]
pub const fn mib(n: usize) -> usize {
    kib(n) * 1024
}

#[must_use]
pub const fn gib(n: usize) -> usize {
    mib(n) * 1024
}

const _: () = assert!(DEFAULT_ALIGNMENT.is_power_of_two());
const _: () = assert!(TRACKING_ALIGNMENT.is_power_of_two());
