//! # Kernel Configuration
//!
//! Authoritative memory-layout constants shared by the kernel crates and the
//! user-level fork library. Centralizing them here prevents configuration
//! drift between the syscall validation layer and the protocol code that has
//! to agree with it about where the user address space ends.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
