use crate::{PAGE_SHIFT, PAGE_SIZE, VirtAddr};
use core::fmt;

/// A page-aligned virtual address.
///
/// Constructed by rounding down, so the alignment invariant holds by
/// construction. Mapping walks and range checks iterate these rather than raw
/// addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPage(u32);

impl VirtPage {
    /// The page containing `va`.
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtAddr) -> Self {
        Self(va.as_u32() >> PAGE_SHIFT)
    }

    /// The page whose base address is `number * PAGE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn from_number(number: u32) -> Self {
        Self(number)
    }

    /// Sequential page number (base address divided by the page size).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    /// Page-aligned base address.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtAddr {
        VirtAddr::new(self.0 << PAGE_SHIFT)
    }

    /// The next page up, if it exists in the 32-bit space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        if self.0 >= (u32::MAX >> PAGE_SHIFT) {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }

    /// All pages intersecting the half-open byte range `[start, end)`,
    /// ascending. The start is rounded down to its page, the end up.
    pub fn span(start: VirtAddr, end: VirtAddr) -> impl Iterator<Item = Self> {
        let first = u64::from(start.as_u32()) >> PAGE_SHIFT;
        let last = (u64::from(end.as_u32()) + u64::from(PAGE_SIZE) - 1) >> PAGE_SHIFT;
        (first..last).map(|n| Self(n as u32))
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VP(0x{:08X})", self.base().as_u32())
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base(), f)
    }
}
