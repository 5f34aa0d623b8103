use crate::{ENTRIES_PER_TABLE, PAGE_SHIFT, PAGE_SIZE, VirtPage, align_down};
use core::fmt;
use core::ops::Add;

/// A 32-bit virtual address.
///
/// A thin wrapper around `u32` that carries intent: values of this type are
/// addresses as seen by a user environment, translated through that
/// environment's page directory. Keeping the wrapper around prevents mixing
/// addresses with frame handles or plain counters.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the page directory (top ten bits).
    #[inline]
    #[must_use]
    pub const fn dir_index(self) -> usize {
        (self.0 >> (PAGE_SHIFT + 10)) as usize % ENTRIES_PER_TABLE
    }

    /// Index into the page table (middle ten bits).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize % ENTRIES_PER_TABLE
    }

    /// Byte offset within the page (low twelve bits).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 % PAGE_SIZE
    }

    /// The page containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtPage {
        VirtPage::containing(self)
    }

    /// The page-aligned base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for VirtAddr {
    #[inline]
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl Add<u32> for VirtAddr {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}
