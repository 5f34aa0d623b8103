//! # Virtual Memory Support
//!
//! The two-level page-table abstraction: one [`AddressSpace`] per
//! environment, built from refcounted frames out of the
//! [`kernel_frames::FrameArena`].
//!
//! ## Virtual Address → Frame Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  DIR  | TABLE | Offset |
//! ```
//!
//! The directory frame holds 1024 entries; a present directory entry names
//! the frame holding a page table of another 1024 entries; a present table
//! entry names the mapped frame and carries the permission bits. Both table
//! levels are ordinary arena frames, read and written as little-endian `u32`
//! entries at explicit offsets — never by casting frame bytes to a struct.
//!
//! ## Permission bits
//!
//! [`PageEntry`] models the full entry. Besides the hardware-meaningful
//! `present` / `writable` / `user` bits it carries two convention bits in the
//! OS-available region — `cow` and `shared` — that the kernel merely permits
//! or denies in a request; only the user-level fork protocol interprets them.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address_space;
mod page_entry;
mod tlb;

pub use address_space::{AddressSpace, EntryRef};
pub use page_entry::PageEntry;
pub use tlb::Tlb;
