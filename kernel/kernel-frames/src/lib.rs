//! # Physical Frame Allocation
//!
//! Tracks every physical 4 KiB frame as either free or allocated, and carries
//! the per-frame reference count that ties independent address spaces
//! together: a frame mapped into both a parent and its forked child has a
//! count of two, and is only returned to the free list when the last mapping
//! goes away.
//!
//! ## Design
//!
//! Frames are identified by stable integer handles ([`FrameId`]); the
//! [`FrameArena`] maps a handle to its descriptor and to its backing storage.
//! Nothing in the kernel ever turns a frame into a raw pointer — page tables
//! and user data alike are read and written through the arena's byte
//! accessors.
//!
//! ## Invariants
//!
//! - A frame on the free list has a reference count of zero.
//! - A frame with a non-zero count is mapped somewhere and is never handed
//!   out again until the count drops back to zero.
//! - Freeing a frame whose count is non-zero, or freeing a free frame, is a
//!   kernel bug and panics rather than reporting an error.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;

pub use arena::{FRAME_BYTES, FrameArena, FrameId, OutOfFrames};
