//! Fault delivery: routing a page fault back up into a user-installed
//! handler, plus the simulated user-mode loads and stores that trigger one.
//!
//! The trap plumbing that decides *that* a fault occurred lives outside this
//! core; what is modeled here is the data crossing the boundary (the fault
//! record) and the delivery contract: the handler runs on its dedicated
//! stack, and an environment without a viable handler is terminated.

use crate::env::{EnvId, TrapContext};
use crate::kernel::Kernel;
use crate::syscall::SysError;
use bitfield_struct::bitfield;
use kernel_addresses::{PAGE_SIZE, VirtAddr};
use kernel_frames::FrameId;
use kernel_info::memory::FAULT_STACK_PAGE;
use kernel_vmem::PageEntry;

/// Reentrant fault ceiling: a handler that keeps faulting is broken, give up
/// after this many nested deliveries instead of recursing forever.
const MAX_FAULT_DEPTH: u32 = 8;

/// Raw fault-error bits, laid out like the x86 page-fault error code.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct FaultErr {
    /// Set when the page was present and the fault is a permission
    /// violation; clear for a not-present fault.
    pub protection: bool,

    /// Set for a store, clear for a load.
    pub write: bool,

    /// Set when the access came from user mode. Always set here.
    pub user: bool,

    #[bits(29)]
    _reserved: u32,
}

/// Everything the trap layer hands to a user fault handler.
#[derive(Copy, Clone, Debug)]
pub struct FaultRecord {
    /// The faulting virtual address.
    pub va: VirtAddr,
    /// Raw fault-error bits.
    pub err: FaultErr,
    /// The register state to resume once the handler returns.
    pub ctx: TrapContext,
}

/// A user fault handler giving up: the fault is not one it can repair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("fault upcall failed: {reason}")]
pub struct UpcallFailed {
    pub reason: &'static str,
}

/// A user-installed fault handler entry point.
///
/// The kernel reference stands in for "the handler runs in user mode and may
/// issue further syscalls"; a real machine would re-enter through the
/// trampoline instead.
pub type FaultUpcall = fn(&mut Kernel, EnvId, &FaultRecord) -> Result<(), UpcallFailed>;

impl Kernel {
    /// Deliver a page fault at `va` to the environment's installed handler.
    ///
    /// Delivery requires an installed upcall and a writable handler-stack
    /// page; without either, or when the handler itself reports failure or
    /// the nesting ceiling is hit, the environment is terminated.
    ///
    /// # Errors
    /// [`SysError::AccessViolation`] after terminating the environment;
    /// [`SysError::BadEnv`] when `id` does not denote a live environment (or
    /// the handler destroyed it before returning).
    pub fn page_fault(&mut self, id: EnvId, va: VirtAddr, write: bool) -> Result<(), SysError> {
        let slot = self.resolve(id, EnvId::SELF, false)?;
        let present = {
            let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
            env.space.lookup(&self.frames, va.page_base()).is_some()
        };
        let err = FaultErr::new()
            .with_protection(present)
            .with_write(write)
            .with_user(true);

        let Some(upcall) = self.slots[slot].env.as_ref().and_then(|e| e.upcall) else {
            return self.fatal_fault(id, slot, va, err, "no fault handler installed");
        };
        let stack_ok = self
            .user_mem_check(
                slot,
                VirtAddr::new(FAULT_STACK_PAGE),
                PAGE_SIZE as usize,
                PageEntry::user_rw(),
            )
            .is_ok();
        if !stack_ok {
            return self.fatal_fault(id, slot, va, err, "no writable handler stack");
        }
        let depth = self.slots[slot]
            .env
            .as_ref()
            .map_or(0, |e| e.fault_depth);
        if depth >= MAX_FAULT_DEPTH {
            return self.fatal_fault(id, slot, va, err, "fault recursion ceiling");
        }
        let ctx = {
            let env = self.slots[slot].env.as_mut().ok_or(SysError::BadEnv)?;
            env.fault_depth += 1;
            env.ctx
        };

        let record = FaultRecord { va, err, ctx };
        let verdict = upcall(self, id, &record);

        // The handler may have destroyed its own environment (or recycled
        // the slot); only a surviving environment gets its depth unwound.
        let env = self.slots[slot]
            .env
            .as_mut()
            .filter(|e| e.id == id)
            .ok_or(SysError::BadEnv)?;
        env.fault_depth -= 1;
        match verdict {
            Ok(()) => Ok(()),
            Err(failed) => self.fatal_fault(id, slot, va, err, failed.reason),
        }
    }

    fn fatal_fault(
        &mut self,
        id: EnvId,
        slot: usize,
        va: VirtAddr,
        err: FaultErr,
        reason: &'static str,
    ) -> Result<(), SysError> {
        log::warn!(
            "[{id}] unrecoverable fault at {va} (err {:#05b}): {reason}, terminating",
            err.into_bits()
        );
        self.env_free(slot);
        Err(SysError::AccessViolation(va))
    }

    /// Simulated user-mode store of `bytes` at `va`.
    ///
    /// A page that is not mapped user-writable raises a write fault exactly
    /// as hardware would; if the handler repairs the mapping the store is
    /// retried once.
    ///
    /// # Errors
    /// Whatever [`page_fault`](Self::page_fault) returned, or
    /// [`SysError::AccessViolation`] when the retry still finds no writable
    /// mapping.
    pub fn user_write(&mut self, id: EnvId, va: VirtAddr, bytes: &[u8]) -> Result<(), SysError> {
        let mut at = va;
        let mut done = 0;
        while done < bytes.len() {
            let offset = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(bytes.len() - done);
            let frame = self.translate(id, at, true)?;
            self.frames.bytes_mut(frame)[offset..offset + n]
                .copy_from_slice(&bytes[done..done + n]);
            done += n;
            at = VirtAddr::new(at.as_u32().wrapping_add(n as u32));
        }
        Ok(())
    }

    /// Simulated user-mode load of `len` bytes at `va` into `out`.
    ///
    /// # Errors
    /// As for [`user_write`](Self::user_write), with a read fault instead.
    pub fn user_read(
        &mut self,
        id: EnvId,
        va: VirtAddr,
        out: &mut [u8],
    ) -> Result<(), SysError> {
        let mut at = va;
        let mut done = 0;
        while done < out.len() {
            let offset = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(out.len() - done);
            let frame = self.translate(id, at, false)?;
            out[done..done + n].copy_from_slice(&self.frames.bytes(frame)[offset..offset + n]);
            done += n;
            at = VirtAddr::new(at.as_u32().wrapping_add(n as u32));
        }
        Ok(())
    }

    /// Simulated user-mode copy of `len` bytes from `src` to `dst`, both in
    /// the same environment's address space.
    ///
    /// Staged through a bounce buffer; source and destination may live in
    /// different frames of the shared arena.
    ///
    /// # Errors
    /// As for [`user_write`](Self::user_write), for either side.
    pub fn user_copy(
        &mut self,
        id: EnvId,
        src: VirtAddr,
        dst: VirtAddr,
        len: usize,
    ) -> Result<(), SysError> {
        let mut buf = [0_u8; 512];
        let mut copied = 0;
        while copied < len {
            let n = buf.len().min(len - copied);
            let at_src = VirtAddr::new(src.as_u32().wrapping_add(copied as u32));
            let at_dst = VirtAddr::new(dst.as_u32().wrapping_add(copied as u32));
            self.user_read(id, at_src, &mut buf[..n])?;
            self.user_write(id, at_dst, &buf[..n])?;
            copied += n;
        }
        Ok(())
    }

    /// Translate one user access, faulting and retrying once on failure.
    fn translate(&mut self, id: EnvId, va: VirtAddr, write: bool) -> Result<FrameId, SysError> {
        if let Some(frame) = self.try_translate(id, va, write)? {
            return Ok(frame);
        }
        self.page_fault(id, va, write)?;
        match self.try_translate(id, va, write)? {
            Some(frame) => Ok(frame),
            None => Err(SysError::AccessViolation(va)),
        }
    }

    fn try_translate(
        &self,
        id: EnvId,
        va: VirtAddr,
        write: bool,
    ) -> Result<Option<FrameId>, SysError> {
        let slot = self.resolve(id, EnvId::SELF, false)?;
        let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
        Ok(env
            .space
            .lookup(&self.frames, va.page_base())
            .filter(|(_, entry)| {
                entry.user() && (!write || entry.writable())
            })
            .map(|(frame, _)| frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn booted() -> (Kernel, EnvId) {
        let mut kernel = Kernel::new(256);
        let root = kernel.create_root_env().unwrap();
        (kernel, root)
    }

    fn install_stack(kernel: &mut Kernel, id: EnvId) {
        kernel
            .sys_page_alloc(
                id,
                EnvId::SELF,
                VirtAddr::new(FAULT_STACK_PAGE),
                PageEntry::user_rw(),
            )
            .unwrap();
    }

    #[test]
    fn fault_without_a_handler_terminates_the_environment() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        let va = VirtAddr::new(0x6000);
        assert_eq!(
            kernel.page_fault(child, va, true),
            Err(SysError::AccessViolation(va))
        );
        assert!(kernel.env_status(child).is_none());
    }

    #[test]
    fn fault_without_a_handler_stack_terminates_the_environment() {
        fn never_called(_: &mut Kernel, _: EnvId, _: &FaultRecord) -> Result<(), UpcallFailed> {
            unreachable!("delivery must be refused before the handler runs")
        }
        let (mut kernel, root) = booted();
        kernel
            .sys_env_set_fault_upcall(root, EnvId::SELF, never_called)
            .unwrap();
        let va = VirtAddr::new(0x6000);
        assert_eq!(
            kernel.page_fault(root, va, true),
            Err(SysError::AccessViolation(va))
        );
        assert!(kernel.env_status(root).is_none());
    }

    #[test]
    fn the_record_carries_the_fault_kind() {
        static SEEN: AtomicU32 = AtomicU32::new(0);
        fn recorder(_: &mut Kernel, _: EnvId, record: &FaultRecord) -> Result<(), UpcallFailed> {
            SEEN.store(record.err.into_bits(), Ordering::Relaxed);
            Err(UpcallFailed { reason: "recorder only" })
        }
        let (mut kernel, root) = booted();
        install_stack(&mut kernel, root);
        kernel
            .sys_env_set_fault_upcall(root, EnvId::SELF, recorder)
            .unwrap();
        // Write to an unmapped page: write+user, not a protection fault.
        let _ = kernel.page_fault(root, VirtAddr::new(0x6000), true);
        let err = FaultErr::from_bits(SEEN.load(Ordering::Relaxed));
        assert!(err.write() && err.user() && !err.protection());
    }

    #[test]
    fn a_failing_handler_is_fatal() {
        fn refuse(_: &mut Kernel, _: EnvId, _: &FaultRecord) -> Result<(), UpcallFailed> {
            Err(UpcallFailed { reason: "not recoverable" })
        }
        let (mut kernel, root) = booted();
        install_stack(&mut kernel, root);
        kernel
            .sys_env_set_fault_upcall(root, EnvId::SELF, refuse)
            .unwrap();
        let va = VirtAddr::new(0x6000);
        assert_eq!(
            kernel.user_write(root, va, b"x"),
            Err(SysError::AccessViolation(va))
        );
        assert!(kernel.env_status(root).is_none());
    }

    #[test]
    fn a_repairing_handler_lets_the_store_retry() {
        fn map_it(kernel: &mut Kernel, id: EnvId, record: &FaultRecord) -> Result<(), UpcallFailed> {
            kernel
                .sys_page_alloc(id, EnvId::SELF, record.va.page_base(), PageEntry::user_rw())
                .map_err(|_| UpcallFailed { reason: "allocation failed" })
        }
        let (mut kernel, root) = booted();
        install_stack(&mut kernel, root);
        kernel
            .sys_env_set_fault_upcall(root, EnvId::SELF, map_it)
            .unwrap();
        let va = VirtAddr::new(0x6008);
        kernel.user_write(root, va, b"demand paged").unwrap();
        let mut back = [0_u8; 12];
        kernel.user_read(root, va, &mut back).unwrap();
        assert_eq!(&back, b"demand paged");
    }

    #[test]
    fn runaway_fault_recursion_is_cut_off() {
        fn faults_again(kernel: &mut Kernel, id: EnvId, record: &FaultRecord) -> Result<(), UpcallFailed> {
            // Never repairs anything, just faults at the next page over.
            let next = VirtAddr::new(record.va.as_u32().wrapping_add(PAGE_SIZE));
            let _ = kernel.page_fault(id, next, true);
            Err(UpcallFailed { reason: "still faulting" })
        }
        let (mut kernel, root) = booted();
        install_stack(&mut kernel, root);
        kernel
            .sys_env_set_fault_upcall(root, EnvId::SELF, faults_again)
            .unwrap();
        // The ceiling fires somewhere down the nesting; by the time the
        // outermost delivery unwinds, the environment is gone.
        assert!(kernel.page_fault(root, VirtAddr::new(0x6000), true).is_err());
        assert!(kernel.env_status(root).is_none());
    }

    #[test]
    fn stores_crossing_a_page_boundary_land_in_both_frames() {
        let (mut kernel, root) = booted();
        kernel
            .sys_page_alloc(root, EnvId::SELF, VirtAddr::new(0x1000), PageEntry::user_rw())
            .unwrap();
        kernel
            .sys_page_alloc(root, EnvId::SELF, VirtAddr::new(0x2000), PageEntry::user_rw())
            .unwrap();
        let near_end = VirtAddr::new(0x2000 - 3);
        kernel.user_write(root, near_end, b"spanning").unwrap();
        let mut back = [0_u8; 8];
        kernel.user_read(root, near_end, &mut back).unwrap();
        assert_eq!(&back, b"spanning");
    }
}
