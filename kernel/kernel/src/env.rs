//! Environments: the kernel's notion of a process.

use crate::trap::FaultUpcall;
use core::fmt;
use kernel_addresses::VirtAddr;
use kernel_vmem::AddressSpace;

/// log2 of [`NENV`]; the low bits of an [`EnvId`] select the slot.
pub(crate) const LOG2_NENV: u32 = 6;

/// Number of environment slots.
pub(crate) const NENV: usize = 1 << LOG2_NENV;

/// Generation-stamped environment identity.
///
/// The low [`LOG2_NENV`] bits select a slot in the environment table; the
/// remaining bits carry a per-slot generation counter, bumped every time the
/// slot is recycled. A stale handle to a terminated environment therefore
/// never denotes its successor — resolution compares the full stamp, not the
/// slot index.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// Names the calling environment in any syscall. Raw value zero — the
    /// same value the fork protocol receives as the "I am the child"
    /// sentinel, since a real stamp is never zero.
    pub const SELF: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub(crate) const fn make(generation: u32, slot: usize) -> Self {
        Self((generation << LOG2_NENV) | slot as u32)
    }

    #[inline]
    #[must_use]
    pub(crate) const fn slot(self) -> usize {
        (self.0 as usize) % NENV
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling state of an environment slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnvStatus {
    /// Freshly created (or mid-fork) and not yet eligible to run.
    NotRunnable,
    /// Eligible to run.
    Runnable,
    /// Currently executing.
    Running,
}

/// The register state saved when an environment traps into the kernel, and
/// restored when it resumes.
///
/// The simulated machine keeps just enough state for the contracts that
/// matter here: `ret` is the register a resumed syscall's result appears in —
/// forcing it to zero in a fresh child is what gives `exofork` its
/// dual-return shape.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapContext {
    pub pc: VirtAddr,
    pub sp: VirtAddr,
    pub ret: u32,
}

/// One live environment.
pub(crate) struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent: EnvId,
    pub(crate) status: EnvStatus,
    pub(crate) space: AddressSpace,
    pub(crate) ctx: TrapContext,
    pub(crate) upcall: Option<FaultUpcall>,
    pub(crate) fault_depth: u32,
}

/// One slot of the environment table, carrying the generation counter that
/// outlives the environments cycled through it.
pub(crate) struct EnvSlot {
    pub(crate) next_generation: u32,
    pub(crate) env: Option<Env>,
}
