use kernel_addresses::VirtPage;

/// Translation-cache model for one address space.
///
/// The simulated machine has no hardware TLB to flush, but the contract is
/// the same: every mutation of a live entry must invalidate the cached
/// translation for that page before the next access. This type records the
/// invalidations so the contract stays observable and testable.
#[derive(Debug, Default)]
pub struct Tlb {
    invalidations: u64,
    last: Option<VirtPage>,
}

impl Tlb {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            invalidations: 0,
            last: None,
        }
    }

    /// Discard the cached translation for `page`.
    #[inline]
    pub const fn invalidate(&mut self, page: VirtPage) {
        self.invalidations += 1;
        self.last = Some(page);
    }

    /// Number of invalidations issued so far.
    #[inline]
    #[must_use]
    pub const fn invalidations(&self) -> u64 {
        self.invalidations
    }

    /// Most recently invalidated page, if any.
    #[inline]
    #[must_use]
    pub const fn last_invalidated(&self) -> Option<VirtPage> {
        self.last
    }
}
