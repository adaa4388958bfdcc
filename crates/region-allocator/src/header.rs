//! Allocation headers and every raw memory access the schemes perform.
//!
//! A header sits immediately before the data it describes, so a data pointer
//! and its header are always a fixed, header-size offset apart:
//!
//! ```text
//! Frame Layout (variable size):
//! ┌─────────────┬──────────────────────────────┬─────────────────┬─────────┐
//! │ padding     │ AllocHeader                  │ payload         │ slack   │
//! │ (adjustment)│ next|prev|frame_size|adj|dbg │                 │         │
//! └─────────────┴──────────────────────────────┴─────────────────┴─────────┘
//! ▲             ▲                              ▲
//! frame start   header = start + adjustment    data = header + header size
//! ◄─────────────────────────── frame_size ─────────────────────────────────►
//! ```
//!
//! The four header shapes are spelled as one generic struct,
//! `AllocHeader<S, T>`: `S` is [`VariableSize`] or [`FixedSize`] and `T` is the
//! tracking policy's header extension. The fixed-size and untracked parts are
//! zero-sized, so the untracked variants carry no overhead.
//!
//! Headers are placed at addresses aligned to the *scheme's* alignment, which
//! may be smaller than the alignment of a pointer. All field access therefore
//! goes through unaligned reads and writes on raw pointers; no reference to a
//! header is ever created.
//!
//! The `next`/`prev` links are reused for two lists: while a frame is live they
//! link the region's all-allocations list, and while a freelist block is free
//! they link the address-ordered free list.

use core::{mem, ptr};

use crate::align::align_up;

/// Size class part of a variable-size header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VariableSize {
    /// Total bytes of the frame: padding, header, payload and slack.
    frame_size: usize,
    /// Distance from the unaligned frame start to the header.
    adjustment: usize,
}

/// Size class part of a fixed-size header. The frame size is owned by the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixedSize;

/// An allocation header, laid out in front of each frame's payload.
#[derive(Debug)]
#[repr(C)]
pub struct AllocHeader<S, T> {
    next: *mut Self,
    prev: *mut Self,
    size: S,
    tracking: T,
}

/// Header used by the stack and freelist schemes.
pub type VariableSizeHeader<T> = AllocHeader<VariableSize, T>;

/// Header used by the pool scheme.
pub type FixedSizeHeader<T> = AllocHeader<FixedSize, T>;

impl<S, T> AllocHeader<S, T>
where
    S: Copy,
    T: Copy,
{
    /// Size of the header rounded up to `align`.
    ///
    /// This is the fixed offset between a header and its data.
    #[must_use]
    pub const fn padded_size(align: usize) -> usize {
        align_up(mem::size_of::<Self>(), align)
    }

    /// Writes a fresh header at `this`.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes of `size_of::<Self>()` bytes.
    pub(crate) unsafe fn init(this: *mut Self, size: S, tracking: T) {
        assert!(!this.is_null(), "header pointer must not be null");
        unsafe {
            this.write_unaligned(Self {
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                size,
                tracking,
            });
        }
    }

    /// Recovers the header from a data pointer.
    ///
    /// # Safety
    ///
    /// `data` must have been produced by [`Self::data`] with the same
    /// `header_size`.
    pub(crate) unsafe fn from_data(data: *mut u8, header_size: usize) -> *mut Self {
        unsafe { data.sub(header_size).cast::<Self>() }
    }

    /// Returns the data pointer following the header.
    ///
    /// # Safety
    ///
    /// `this` must be a header placed inside a frame large enough to hold
    /// `header_size` bytes after it.
    pub(crate) unsafe fn data(this: *mut Self, header_size: usize) -> *mut u8 {
        unsafe { this.cast::<u8>().add(header_size) }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn next(this: *mut Self) -> *mut Self {
        unsafe { (&raw const (*this).next).read_unaligned() }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn set_next(this: *mut Self, next: *mut Self) {
        unsafe { (&raw mut (*this).next).write_unaligned(next) }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn prev(this: *mut Self) -> *mut Self {
        unsafe { (&raw const (*this).prev).read_unaligned() }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn set_prev(this: *mut Self, prev: *mut Self) {
        unsafe { (&raw mut (*this).prev).write_unaligned(prev) }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn tracking(this: *mut Self) -> T {
        unsafe { (&raw const (*this).tracking).read_unaligned() }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn set_tracking(this: *mut Self, tracking: T) {
        unsafe { (&raw mut (*this).tracking).write_unaligned(tracking) }
    }

    /// Appends `node` to the list ending at `tail`.
    ///
    /// # Safety
    ///
    /// `node` must be an initialized header not linked in any list, and `tail`
    /// must be null or the last node of a well-formed list.
    pub(crate) unsafe fn push_back(tail: &mut *mut Self, node: *mut Self) {
        assert!(!node.is_null(), "node must not be null");
        assert!(!ptr::eq(*tail, node), "node must not be linked twice");
        unsafe {
            Self::set_next(node, ptr::null_mut());
            Self::set_prev(node, *tail);
            if !tail.is_null() {
                Self::set_next(*tail, node);
            }
        }
        *tail = node;
    }

    /// Links `node` between `prev` and `next`, either of which may be null.
    ///
    /// Updates `head` when `node` becomes the first node.
    ///
    /// # Safety
    ///
    /// `prev` and `next` must be adjacent nodes of the list starting at
    /// `head` (or null at its ends), and `node` must not be linked.
    pub(crate) unsafe fn insert_between(
        head: &mut *mut Self,
        node: *mut Self,
        prev: *mut Self,
        next: *mut Self,
    ) {
        assert!(!node.is_null(), "node must not be null");
        unsafe {
            assert!(prev.is_null() || ptr::eq(Self::next(prev), next));
            Self::set_prev(node, prev);
            Self::set_next(node, next);
            if prev.is_null() {
                *head = node;
            } else {
                Self::set_next(prev, node);
            }
            if !next.is_null() {
                Self::set_prev(next, node);
            }
        }
    }

    /// Puts `new` in the list position held by `old`.
    ///
    /// # Safety
    ///
    /// `old` must be linked in the list starting at `head`; `new` must be an
    /// initialized header not linked in any list.
    pub(crate) unsafe fn replace(head: &mut *mut Self, old: *mut Self, new: *mut Self) {
        unsafe {
            let prev = Self::prev(old);
            let next = Self::next(old);
            Self::set_prev(new, prev);
            Self::set_next(new, next);
            if prev.is_null() {
                assert!(ptr::eq(*head, old), "unlinked node must be the head");
                *head = new;
            } else {
                Self::set_next(prev, new);
            }
            if !next.is_null() {
                Self::set_prev(next, new);
            }
            Self::set_next(old, ptr::null_mut());
            Self::set_prev(old, ptr::null_mut());
        }
    }

    /// Removes `node` from its list, fixing the neighbours and the optional
    /// `head`/`tail` anchors.
    ///
    /// # Safety
    ///
    /// `node` must be linked in the list described by `head`/`tail`.
    pub(crate) unsafe fn unlink(
        head: Option<&mut *mut Self>,
        tail: Option<&mut *mut Self>,
        node: *mut Self,
    ) {
        assert!(!node.is_null(), "node must not be null");
        unsafe {
            let prev = Self::prev(node);
            let next = Self::next(node);
            if !prev.is_null() {
                Self::set_next(prev, next);
            }
            if !next.is_null() {
                Self::set_prev(next, prev);
            }
            if let Some(head) = head
                && ptr::eq(*head, node)
            {
                *head = next;
            }
            if let Some(tail) = tail
                && ptr::eq(*tail, node)
            {
                *tail = prev;
            }
            Self::set_next(node, ptr::null_mut());
            Self::set_prev(node, ptr::null_mut());
        }
    }
}

impl<T> AllocHeader<VariableSize, T>
where
    T: Copy,
{
    /// Writes a fresh variable-size header at `this`.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes of `size_of::<Self>()` bytes.
    pub(crate) unsafe fn init_frame(
        this: *mut Self,
        frame_size: usize,
        adjustment: usize,
        tracking: T,
    ) {
        unsafe {
            Self::init(
                this,
                VariableSize {
                    frame_size,
                    adjustment,
                },
                tracking,
            );
        }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn frame_size(this: *mut Self) -> usize {
        unsafe { (&raw const (*this).size.frame_size).read_unaligned() }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn set_frame_size(this: *mut Self, frame_size: usize) {
        unsafe { (&raw mut (*this).size.frame_size).write_unaligned(frame_size) }
    }

    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn adjustment(this: *mut Self) -> usize {
        unsafe { (&raw const (*this).size.adjustment).read_unaligned() }
    }

    /// Returns the unaligned start of the frame (`header - adjustment`).
    ///
    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn frame_start(this: *mut Self) -> *mut u8 {
        unsafe { this.cast::<u8>().sub(Self::adjustment(this)) }
    }

    /// Returns the address one past the end of the frame.
    ///
    /// # Safety
    ///
    /// `this` must point to an initialized header.
    pub(crate) unsafe fn frame_end(this: *mut Self) -> *mut u8 {
        unsafe { Self::frame_start(this).add(Self::frame_size(this)) }
    }

    /// Returns `true` if the frame of `left` ends exactly where the frame of
    /// `right` starts.
    ///
    /// # Safety
    ///
    /// Both pointers must point to initialized headers.
    pub(crate) unsafe fn can_join(left: *mut Self, right: *mut Self) -> bool {
        unsafe { ptr::eq(Self::frame_end(left), Self::frame_start(right)) }
    }
}

/// The size-class part of a header, giving access to the frame it spans.
pub(crate) trait SizeClass: Copy {
    /// Returns `(frame_start, frame_size)` of the frame owning `header`.
    ///
    /// `slot_size` is the frame size used by fixed-size headers.
    ///
    /// # Safety
    ///
    /// `header` must point to an initialized header.
    unsafe fn frame_span<T: Copy>(
        header: *mut AllocHeader<Self, T>,
        slot_size: usize,
    ) -> (usize, usize);
}

impl SizeClass for VariableSize {
    unsafe fn frame_span<T: Copy>(
        header: *mut AllocHeader<Self, T>,
        _slot_size: usize,
    ) -> (usize, usize) {
        unsafe {
            (
                AllocHeader::frame_start(header).addr(),
                AllocHeader::frame_size(header),
            )
        }
    }
}

impl SizeClass for FixedSize {
    unsafe fn frame_span<T: Copy>(
        header: *mut AllocHeader<Self, T>,
        slot_size: usize,
    ) -> (usize, usize) {
        (header.addr(), slot_size)
    }
}

/// Zeroes `len` bytes at `ptr` when the `zero-fill` feature is enabled.
///
/// # Safety
///
/// `ptr..ptr + len` must be valid for writes unless `len` is zero.
pub(crate) unsafe fn zero_fill(ptr: *mut u8, len: usize) {
    #[cfg(feature = "zero-fill")]
    if len > 0 {
        unsafe {
            ptr.write_bytes(0, len);
        }
    }
    #[cfg(not(feature = "zero-fill"))]
    let _ = (ptr, len);
}

/// Copies `len` payload bytes between two live frames.
///
/// # Safety
///
/// Both ranges must be valid and must not overlap.
pub(crate) unsafe fn copy_payload(src: *const u8, dst: *mut u8, len: usize) {
    unsafe { ptr::copy_nonoverlapping(src, dst, len) }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    type Header = VariableSizeHeader<()>;

    #[test]
    fn test_untracked_fixed_header_is_two_links() {
        assert_eq!(
            mem::size_of::<FixedSizeHeader<()>>(),
            2 * mem::size_of::<*mut u8>()
        );
        assert_eq!(
            mem::size_of::<VariableSizeHeader<()>>(),
            4 * mem::size_of::<usize>()
        );
    }

    #[test]
    fn test_padded_size_is_multiple_of_alignment() {
        for align in [1, 4, 8, 16, 64] {
            let size = Header::padded_size(align);
            assert!(size >= mem::size_of::<Header>());
            assert_eq!(size % align, 0);
        }
    }

    #[test]
    fn test_unaligned_header_round_trip() {
        let mut buf = [0_u8; 128];
        // deliberately misaligned for pointer-sized fields
        let frame_start = unsafe { buf.as_mut_ptr().add(3) };
        let header = unsafe { frame_start.add(1) }.cast::<Header>();
        let header_size = Header::padded_size(4);
        unsafe {
            Header::init_frame(header, 64, 1, ());
            assert_eq!(Header::frame_size(header), 64);
            assert_eq!(Header::adjustment(header), 1);
            assert_eq!(Header::frame_start(header), frame_start);
            assert_eq!(Header::frame_end(header), frame_start.add(64));

            let data = Header::data(header, header_size);
            assert_eq!(Header::from_data(data, header_size), header);
        }
    }

    #[test]
    fn test_list_splicing() {
        let mut buf = [0_u8; 512];
        let base = buf.as_mut_ptr();
        let node = |offset: usize| base.wrapping_add(offset).cast::<Header>();
        let nodes = [node(1), node(65), node(129)];
        let mut head: *mut Header = ptr::null_mut();
        let mut tail: *mut Header = ptr::null_mut();
        unsafe {
            for &node in &nodes {
                Header::init_frame(node, 64, 1, ());
                Header::push_back(&mut tail, node);
                if head.is_null() {
                    head = node;
                }
            }
            assert_eq!(Header::next(nodes[0]), nodes[1]);
            assert_eq!(Header::prev(nodes[2]), nodes[1]);

            Header::unlink(Some(&mut head), Some(&mut tail), nodes[1]);
            assert_eq!(Header::next(nodes[0]), nodes[2]);
            assert_eq!(Header::prev(nodes[2]), nodes[0]);

            Header::insert_between(&mut head, nodes[1], nodes[0], nodes[2]);
            assert_eq!(Header::next(nodes[0]), nodes[1]);
            assert_eq!(Header::next(nodes[1]), nodes[2]);

            Header::unlink(Some(&mut head), Some(&mut tail), nodes[0]);
            assert_eq!(head, nodes[1]);
            Header::unlink(Some(&mut head), Some(&mut tail), nodes[2]);
            assert_eq!(tail, nodes[1]);
        }
    }

    #[test]
    fn test_can_join_requires_exact_contiguity() {
        let mut buf = [0_u8; 256];
        let base = buf.as_mut_ptr();
        unsafe {
            let left = base.add(1).cast::<Header>();
            Header::init_frame(left, 64, 1, ());
            let right = base.add(64 + 2).cast::<Header>();
            Header::init_frame(right, 64, 2, ());
            assert!(Header::can_join(left, right));

            let near_miss = base.add(65 + 2).cast::<Header>();
            Header::init_frame(near_miss, 64, 2, ());
            assert!(!Header::can_join(left, near_miss));
        }
    }
}
