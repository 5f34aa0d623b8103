use bitfield_struct::bitfield;
use kernel_frames::FrameId;

/// A single 32-bit page-table entry (or, with the frame bits cleared, a bare
/// permission-flag value as passed through the syscall layer).
///
/// ### Bit layout
///
/// | Bits   | Name      | Meaning |
/// |--------|-----------|----------|
/// | 0      | `present` | Valid mapping if set |
/// | 1      | `writable`| Writes allowed if set |
/// | 2      | `user`    | User-mode access allowed if set |
/// | 3‒8    | reserved  | Always zero |
/// | 9      | `shared`  | Convention: map identically into a forked child |
/// | 10     | `cow`     | Convention: copy-on-write, take a private copy on write |
/// | 11     | available | Unassigned OS-available bit |
/// | 12‒31  | `frame`   | Frame handle of the mapped page |
///
/// The `shared` and `cow` bits have no hardware meaning. The kernel only
/// checks that a request keeps inside the user-grantable set; the fork
/// protocol and the fault handler give them their semantics.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageEntry {
    /// Present (bit 0). A cleared entry maps nothing; all other bits of an
    /// absent entry are ignored.
    pub present: bool,

    /// Writable (bit 1). Cleared means read-only; user writes fault.
    pub writable: bool,

    /// User-accessible (bit 2). Cleared restricts the page to the kernel.
    pub user: bool,

    #[bits(6)]
    _reserved: u8,

    /// Shared-on-fork convention bit (bit 9).
    pub shared: bool,

    /// Copy-on-write convention bit (bit 10).
    pub cow: bool,

    _available: bool,

    /// Frame handle of the mapped page (bits 12..32).
    #[bits(20)]
    frame: u32,
}

impl PageEntry {
    /// Every bit a user environment may ask for through the syscall layer:
    /// the three access bits plus the two convention bits.
    pub const USER_GRANTABLE: Self = Self::new()
        .with_present(true)
        .with_writable(true)
        .with_user(true)
        .with_shared(true)
        .with_cow(true);

    /// Present, user-readable.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user(true)
    }

    /// Present, user-readable and writable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::user_ro().with_writable(true)
    }

    /// Present, user-readable, copy-on-write (not writable).
    #[inline]
    #[must_use]
    pub const fn user_cow() -> Self {
        Self::user_ro().with_cow(true)
    }

    /// The frame this entry maps.
    #[inline]
    #[must_use]
    pub const fn frame_id(self) -> FrameId {
        FrameId::from_raw(self.frame())
    }

    /// This entry pointed at `frame`.
    #[inline]
    #[must_use]
    pub const fn with_frame_id(self, frame: FrameId) -> Self {
        self.with_frame(frame.as_raw())
    }

    /// Just the permission bits: the entry with the frame bits cleared.
    #[inline]
    #[must_use]
    pub const fn perms(self) -> Self {
        self.with_frame(0)
    }

    /// Whether every flag bit set in `required` is also set here.
    #[inline]
    #[must_use]
    pub const fn covers(self, required: Self) -> bool {
        let need = required.perms().into_bits();
        self.into_bits() & need == need
    }

    /// Present, user-accessible and writable — a page the environment may
    /// store to directly.
    #[inline]
    #[must_use]
    pub const fn is_user_writable(self) -> bool {
        self.present() && self.user() && self.writable()
    }

    /// Restricted to the user-grantable set (drops anything else).
    #[inline]
    #[must_use]
    pub const fn grantable(self) -> Self {
        Self::from_bits(self.into_bits() & Self::USER_GRANTABLE.into_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convention_bits_round_trip() {
        let e = PageEntry::user_cow().with_shared(true);
        assert!(e.present());
        assert!(e.user());
        assert!(!e.writable());
        assert!(e.cow());
        assert!(e.shared());
    }

    #[test]
    fn frame_bits_do_not_leak_into_perms() {
        let e = PageEntry::user_rw().with_frame_id(FrameId::from_raw(0xF_FFFF));
        assert_eq!(e.perms(), PageEntry::user_rw());
        assert_eq!(e.frame_id(), FrameId::from_raw(0xF_FFFF));
    }

    #[test]
    fn covers_ignores_frame_bits_of_requirement() {
        let e = PageEntry::user_rw().with_frame_id(FrameId::from_raw(7));
        assert!(e.covers(PageEntry::user_ro()));
        assert!(e.covers(PageEntry::user_rw()));
        assert!(!PageEntry::user_ro().covers(PageEntry::user_rw()));
    }
}
