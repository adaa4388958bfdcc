//! Address alignment helpers shared by every allocation scheme.
//!
//! The schemes deliberately use a *strict* forward alignment: the returned
//! address is always greater than the input, even when the input is already
//! aligned. The gap between a frame's unaligned start and its aligned header
//! is therefore never empty, and consecutive frames always occupy strictly
//! increasing addresses.
//!
//! ```text
//! addr:       0x1001     0x1004     0x1007     0x1008
//! aligned(4): 0x1004     0x1008     0x1008     0x100c
//! ```

/// Returns the smallest multiple of `alignment` strictly greater than `addr`.
///
/// # Panics
///
/// Panics in debug builds if `alignment` is not a power of two.
///
/// # Examples
///
/// ```
/// use region_allocator::align::align_address;
///
/// assert_eq!(align_address(0x1001, 4), 0x1004);
/// assert_eq!(align_address(0x1004, 4), 0x1008); // already aligned: one full step
/// ```
#[must_use]
#[inline]
pub const fn align_address(addr: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (addr & !(alignment - 1)) + alignment
}

/// Pointer flavour of [`align_address`], preserving the pointer's provenance.
#[must_use]
#[inline]
pub fn align_ptr(ptr: *mut u8, alignment: usize) -> *mut u8 {
    ptr.map_addr(|addr| align_address(addr, alignment))
}

/// Rounds `value` up to a multiple of `alignment` (non-strict).
///
/// Used for sizes, where an already aligned value must stay unchanged.
#[must_use]
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value.next_multiple_of(alignment)
}
