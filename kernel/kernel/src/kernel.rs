//! The kernel object: frame arena, environment table, console.

use crate::env::{Env, EnvId, EnvSlot, EnvStatus, NENV, TrapContext};
use crate::syscall::SysError;
use alloc::vec::Vec;
use kernel_addresses::{PAGE_SIZE, VirtAddr};
use kernel_frames::{FrameArena, FrameId};
use kernel_info::memory::{TRAMPOLINE_BASE, USER_LIMIT};
use kernel_vmem::{AddressSpace, PageEntry};

/// Stand-in bytes for the kernel-installed upcall trampoline page. Shared
/// read-only into every environment descended from the root.
const TRAMPOLINE_STUB: &[u8] = b"upcall trampoline stub\0";

/// All kernel state: constructed once, passed by reference to every
/// consumer. There are no ambient globals.
pub struct Kernel {
    pub(crate) frames: FrameArena,
    pub(crate) slots: Vec<EnvSlot>,
    pub(crate) console: Vec<u8>,
}

impl Kernel {
    /// Boot the kernel with `frame_count` physical frames.
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        Self {
            frames: FrameArena::new(frame_count),
            slots: (0..NENV)
                .map(|_| EnvSlot {
                    next_generation: 1,
                    env: None,
                })
                .collect(),
            console: Vec::new(),
        }
    }

    /// Create the first environment and install the upcall trampoline page
    /// read-only at [`TRAMPOLINE_BASE`]. Descendants inherit the trampoline
    /// through fork, not through creation.
    ///
    /// # Errors
    /// [`SysError::OutOfMemory`] when no slot or frame is available.
    pub fn create_root_env(&mut self) -> Result<EnvId, SysError> {
        let id = self.create_env(EnvId::SELF)?;
        let frame = self.frames.alloc(true)?;
        self.frames.bytes_mut(frame)[..TRAMPOLINE_STUB.len()].copy_from_slice(TRAMPOLINE_STUB);

        let Self { frames, slots, .. } = self;
        let env = slots[id.slot()].env.as_mut().ok_or(SysError::BadEnv)?;
        env.space
            .insert(frames, frame, VirtAddr::new(TRAMPOLINE_BASE), PageEntry::user_ro())?;
        env.status = EnvStatus::Running;
        Ok(id)
    }

    /// Allocate a slot and an empty address space for a new environment.
    pub(crate) fn create_env(&mut self, parent: EnvId) -> Result<EnvId, SysError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.env.is_none())
            .ok_or(SysError::OutOfMemory)?;
        let space = AddressSpace::new(&mut self.frames)?;
        let generation = self.slots[slot].next_generation;
        let id = EnvId::make(generation, slot);
        self.slots[slot].next_generation += 1;
        self.slots[slot].env = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            space,
            ctx: TrapContext::default(),
            upcall: None,
            fault_depth: 0,
        });
        log::info!("[{id}] new env (parent {parent})");
        Ok(id)
    }

    /// Resolve a caller-supplied identity to a live slot.
    ///
    /// `EnvId::SELF` (or the caller's own id) always resolves to the caller.
    /// With `check_authority` set, a foreign target additionally has to be a
    /// direct child of the caller — an environment has no authority over
    /// anything else.
    ///
    /// # Errors
    /// [`SysError::BadEnv`] for a stale stamp, a free slot, or a failed
    /// authority check.
    pub(crate) fn resolve(
        &self,
        caller: EnvId,
        target: EnvId,
        check_authority: bool,
    ) -> Result<usize, SysError> {
        let caller_slot = caller.slot();
        self.slots[caller_slot]
            .env
            .as_ref()
            .filter(|e| e.id == caller)
            .ok_or(SysError::BadEnv)?;
        if target == EnvId::SELF || target == caller {
            return Ok(caller_slot);
        }
        let slot = target.slot();
        let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
        if env.id != target {
            return Err(SysError::BadEnv);
        }
        if check_authority && env.parent != caller {
            return Err(SysError::BadEnv);
        }
        Ok(slot)
    }

    /// Free an environment: tear down its address space and release the slot.
    pub(crate) fn env_free(&mut self, slot: usize) {
        let Self { frames, slots, .. } = self;
        if let Some(mut env) = slots[slot].env.take() {
            env.space.teardown(frames);
            log::info!("[{}] freed", env.id);
        }
    }

    /// Check that `env` may access `[va, va + len)` with at least the
    /// permission bits in `required` (callers include present+user).
    ///
    /// # Errors
    /// The lowest failing address; the caller decides the consequence
    /// (terminating the environment, for buffers crossing the syscall
    /// boundary).
    pub(crate) fn user_mem_check(
        &self,
        slot: usize,
        va: VirtAddr,
        len: usize,
        required: PageEntry,
    ) -> Result<(), VirtAddr> {
        let Some(env) = self.slots[slot].env.as_ref() else {
            return Err(va);
        };
        let start = u64::from(va.as_u32());
        let end = start + len as u64;
        let mut page = start & !u64::from(PAGE_SIZE - 1);
        while page < end {
            // Report the exact start for the first page, page bases after.
            let fault_va = VirtAddr::new(page.max(start) as u32);
            if page >= u64::from(USER_LIMIT) {
                return Err(fault_va);
            }
            match env.space.lookup(&self.frames, VirtAddr::new(page as u32)) {
                Some((_, entry)) if entry.covers(required) => {}
                _ => return Err(fault_va),
            }
            page += u64::from(PAGE_SIZE);
        }
        Ok(())
    }

    /// Copy bytes out of an environment's memory. Returns `None` on an
    /// unmapped page; callers validate the range with
    /// [`user_mem_check`](Self::user_mem_check) first.
    pub(crate) fn copy_from_env(&self, slot: usize, va: VirtAddr, len: usize) -> Option<Vec<u8>> {
        let env = self.slots[slot].env.as_ref()?;
        let mut out = Vec::with_capacity(len);
        let mut at = va;
        while out.len() < len {
            let offset = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(len - out.len());
            let (frame, _) = env.space.lookup(&self.frames, at.page_base())?;
            out.extend_from_slice(&self.frames.bytes(frame)[offset..offset + n]);
            at = VirtAddr::new(at.as_u32().wrapping_add(n as u32));
        }
        Some(out)
    }

    /// The physical frame arena (read-only view).
    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FrameArena {
        &self.frames
    }

    /// Everything written to the console so far.
    #[inline]
    #[must_use]
    pub fn console(&self) -> &[u8] {
        &self.console
    }

    /// Status of the environment `id` currently denotes, if it is live.
    #[must_use]
    pub fn env_status(&self, id: EnvId) -> Option<EnvStatus> {
        let env = self.slots[id.slot()].env.as_ref()?;
        (env.id == id).then_some(env.status)
    }

    /// Saved trap context of a live environment.
    #[must_use]
    pub fn saved_context(&self, id: EnvId) -> Option<TrapContext> {
        let env = self.slots[id.slot()].env.as_ref()?;
        (env.id == id).then_some(env.ctx)
    }

    /// The frame mapped at `va` in a live environment, for tests and
    /// diagnostics.
    #[must_use]
    pub fn frame_at(&self, id: EnvId, va: VirtAddr) -> Option<FrameId> {
        let env = self.slots[id.slot()].env.as_ref()?;
        if env.id != id {
            return None;
        }
        env.space
            .lookup(&self.frames, va.page_base())
            .map(|(frame, _)| frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_env_has_the_trampoline_mapped_read_only() {
        let mut kernel = Kernel::new(128);
        let root = kernel.create_root_env().unwrap();
        let va = VirtAddr::new(TRAMPOLINE_BASE);
        let frame = kernel.frame_at(root, va).unwrap();
        assert!(
            kernel.frames().bytes(frame).starts_with(TRAMPOLINE_STUB)
        );
        let flags = kernel.sys_page_flags(root, EnvId::SELF, va).unwrap().unwrap();
        assert!(flags.present() && flags.user() && !flags.writable());
    }

    #[test]
    fn stale_ids_do_not_resolve_after_slot_reuse() {
        let mut kernel = Kernel::new(128);
        let root = kernel.create_root_env().unwrap();
        let child = kernel.sys_exofork(root).unwrap();
        kernel.sys_env_destroy(root, child).unwrap();
        let successor = kernel.sys_exofork(root).unwrap();
        assert_eq!(child.slot(), successor.slot());
        assert_ne!(child, successor);
        assert!(kernel.env_status(child).is_none());
        assert_eq!(
            kernel.sys_env_destroy(root, child),
            Err(SysError::BadEnv)
        );
    }

    #[test]
    fn environments_cannot_reach_unrelated_targets() {
        let mut kernel = Kernel::new(128);
        let root = kernel.create_root_env().unwrap();
        let a = kernel.sys_exofork(root).unwrap();
        let b = kernel.sys_exofork(root).unwrap();
        // Siblings have no authority over one another.
        assert_eq!(
            kernel.sys_page_unmap(a, b, VirtAddr::new(0x1000)),
            Err(SysError::BadEnv)
        );
        // The parent does.
        assert_eq!(kernel.sys_page_unmap(root, b, VirtAddr::new(0x1000)), Ok(()));
    }
}
