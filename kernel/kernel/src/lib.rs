//! # Kernel Core
//!
//! Ties the frame arena and the per-environment address spaces together
//! behind the only interface user code gets: a validated syscall surface,
//! plus the fault-delivery path that routes a page fault back up into a
//! user-installed handler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  User Environments                  │
//! │   fork protocol, COW fault handler (userland/fork)  │
//! └────────────┬───────────────────────────▲────────────┘
//!     syscalls │                           │ fault upcalls
//! ┌────────────▼───────────────────────────┴────────────┐
//! │               Syscall Validation Layer              │
//! │   address bounds, alignment, flag legality,         │
//! │   identity resolution and authority                 │
//! └────────────┬────────────────────────────────────────┘
//!              │
//! ┌────────────▼────────────────────────────────────────┐
//! │   Environments (kernel) · AddressSpace (kernel-vmem)│
//! │   · FrameArena (kernel-frames)                      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The kernel never trusts an address, length, flag set, or environment
//! identity coming from above: the two privilege levels share no type-system
//! enforcement, so everything user-supplied is validated here before any
//! lower layer sees it.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod env;
mod kernel;
mod syscall;
mod trap;

pub use env::{EnvId, EnvStatus, TrapContext};
pub use kernel::Kernel;
pub use syscall::SysError;
pub use trap::{FaultErr, FaultRecord, FaultUpcall, UpcallFailed};
