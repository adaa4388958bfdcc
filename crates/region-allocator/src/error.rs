use core::{fmt, panic::Location};

use derive_more::{Display, Error, IsVariant};

/// The kinds of errors returned by the allocation schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error, IsVariant)]
#[non_exhaustive]
pub enum AllocErrorKind {
    #[display("out of memory: requested={requested}, available={available}")]
    OutOfMemory { requested: usize, available: usize },
    #[display("pool exhausted: element_size={element_size}, element_count={element_count}")]
    PoolExhausted {
        element_size: usize,
        element_count: usize,
    },
    #[display(
        "invalid free order: frame_start={frame_start:#x}, expected_top_frame={expected:#x}"
    )]
    InvalidFreeOrder { frame_start: usize, expected: usize },
    #[display("foreign pointer: address={address:#x}, region={base:#x}..{end:#x}")]
    ForeignPointer {
        address: usize,
        base: usize,
        end: usize,
    },
    #[display("region too small: size={size}, required={required}")]
    RegionTooSmall { size: usize, required: usize },
    #[display("snapshot buffer too small: capacity={capacity}")]
    SnapshotOverflow { capacity: usize },
    #[display(
        "unsupported layout: size={size}, align={align}, max_size={max_size}, \
         max_align={max_align}"
    )]
    UnsupportedLayout {
        size: usize,
        align: usize,
        max_size: usize,
        max_align: usize,
    },
}

/// The error type returned by the allocation schemes.
#[derive(Clone, Copy)]
pub struct AllocError {
    #[cfg(feature = "error-with-location")]
    location: &'static Location<'static>,
    kind: AllocErrorKind,
}

impl AllocError {
    /// Creates a new error from a known kind of error.
    #[track_caller]
    #[must_use]
    pub fn new(kind: AllocErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "error-with-location")]
            location: Location::caller(),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> &AllocErrorKind {
        &self.kind
    }

    /// Returns the location where this error was created.
    #[must_use]
    #[cfg(feature = "error-with-location")]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Debug for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AllocError");
        d.field("kind", &self.kind);
        #[cfg(feature = "error-with-location")]
        d.field("location", &self.location);
        d.finish()
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl From<AllocErrorKind> for AllocError {
    #[track_caller]
    fn from(kind: AllocErrorKind) -> Self {
        Self::new(kind)
    }
}

impl core::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        core::error::Error::source(&self.kind)
    }
}

impl PartialEq<AllocErrorKind> for AllocError {
    fn eq(&self, other: &AllocErrorKind) -> bool {
        self.kind == *other
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::format;

    use super::*;

    #[test]
    fn test_display_delegates_to_kind() {
        let err = AllocError::new(AllocErrorKind::InvalidFreeOrder {
            frame_start: 0x1000,
            expected: 0x1040,
        });
        assert_eq!(
            format!("{err}"),
            "invalid free order: frame_start=0x1000, expected_top_frame=0x1040"
        );
        assert!(err.kind().is_invalid_free_order());
    }

    #[cfg(feature = "error-with-location")]
    #[test]
    fn test_location_is_caller() {
        let line = line!() + 1;
        let err = AllocError::from(AllocErrorKind::SnapshotOverflow { capacity: 4 });
        assert_eq!(err.location().line(), line);
        assert_eq!(err.location().file(), file!());
    }
}
