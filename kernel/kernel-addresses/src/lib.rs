//! # Virtual Address Types
//!
//! Strongly typed wrappers for the 32-bit virtual addresses translated by the
//! two-level paging structures, plus the page-granularity helpers the rest of
//! the kernel builds on.
//!
//! ## Overview
//!
//! A 32-bit virtual address decomposes into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  DIR  | TABLE | Offset |
//! ```
//!
//! The top ten bits index the page directory, the middle ten bits index the
//! page table the directory entry points at, and the low twelve bits select a
//! byte within the 4 KiB page. [`VirtAddr::dir_index`] and
//! [`VirtAddr::table_index`] perform exactly this decomposition; nothing in
//! the kernel derives table slots by pointer arithmetic.
//!
//! [`VirtPage`] is a page-aligned [`VirtAddr`] by construction and is the
//! currency of everything that iterates mappings one page at a time.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod virtual_address;
mod virtual_page;

pub use virtual_address::VirtAddr;
pub use virtual_page::VirtPage;

/// Size of one page (and one frame) in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// log2([`PAGE_SIZE`]), i.e. the number of offset bits in an address.
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes of virtual address space covered by one directory entry (4 MiB).
pub const PAGE_TABLE_SPAN: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use kernel_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}
