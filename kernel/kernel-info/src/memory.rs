//! # Memory Layout
//!
//! ```text
//! Virtual Address Space Layout (32-bit, per environment):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │          User Space             │
//!             │   (program, heap, user stack)   │
//! USER_STACK_TOP ├─────────────────────────────────┤ 0xEEBF_E000
//!             │          Guard Page             │   (never mapped)
//! FAULT_STACK_PAGE ├─────────────────────────────────┤ 0xEEBF_F000
//!             │     Fault-Handler Stack         │   (private, one page)
//! TRAMPOLINE_BASE ├─────────────────────────────────┤ 0xEEC0_0000
//!             │    Upcall Trampoline Region     │   (kernel-installed, RO)
//! USER_LIMIT  ├─────────────────────────────────┤ 0xEF00_0000
//!             │        Kernel Reserve           │   (never user-mappable)
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

use kernel_addresses::PAGE_SIZE;

/// First address the user may never map; the user/kernel split. Every
/// address argument of a page syscall must lie below this ceiling.
pub const USER_LIMIT: u32 = 0xEF00_0000;

/// Base of the kernel-installed, user-read-only trampoline region
/// `[TRAMPOLINE_BASE, USER_LIMIT)`. Fork maps the pages present here
/// identically into a child.
pub const TRAMPOLINE_BASE: u32 = 0xEEC0_0000;

/// Top of the dedicated fault-handler stack; the handler stack occupies the
/// single page just below.
pub const FAULT_STACK_TOP: u32 = TRAMPOLINE_BASE;

/// Base of the fault-handler stack page. Never shared, never copy-on-write.
pub const FAULT_STACK_PAGE: u32 = FAULT_STACK_TOP - PAGE_SIZE;

/// Top of the ordinary user stack. The page between here and the fault stack
/// stays unmapped as a guard. Fork's duplication walk covers
/// `[0, USER_STACK_TOP)`.
pub const USER_STACK_TOP: u32 = FAULT_STACK_TOP - 2 * PAGE_SIZE;

/// Fixed scratch address the fault handler maps a fresh page at while taking
/// a private copy of a shared page. Only ever mapped transiently.
pub const SCRATCH_PAGE: u32 = 0x0040_0000;

const _: () = {
    assert!(USER_LIMIT % PAGE_SIZE == 0);
    assert!(TRAMPOLINE_BASE % PAGE_SIZE == 0);
    assert!(SCRATCH_PAGE % PAGE_SIZE == 0);
    assert!(TRAMPOLINE_BASE < USER_LIMIT);
    assert!(FAULT_STACK_PAGE < FAULT_STACK_TOP);
    assert!(USER_STACK_TOP < FAULT_STACK_PAGE);
    assert!(SCRATCH_PAGE < USER_STACK_TOP);
};
