//! The syscall surface: every page-table mutation user code can request,
//! validated before any lower layer sees an argument.
//!
//! All address-taking calls reject an out-of-range or misaligned address
//! *before* resolving any environment identity, so error precedence is
//! deterministic.

use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::trap::FaultUpcall;
use kernel_addresses::VirtAddr;
use kernel_frames::OutOfFrames;
use kernel_info::memory::USER_LIMIT;
use kernel_vmem::PageEntry;

/// What a syscall can fail with, as seen from user code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SysError {
    /// The named environment is stale, terminated, or outside the caller's
    /// authority.
    #[error("bad environment id")]
    BadEnv,

    /// Misaligned or out-of-range address, or illegal permission bits.
    #[error("invalid argument")]
    InvalidArgument,

    /// No free frame or environment slot.
    #[error("out of memory")]
    OutOfMemory,

    /// A user-supplied buffer failed validation at the given address. The
    /// offending environment has already been terminated.
    #[error("access violation at {0}")]
    AccessViolation(VirtAddr),
}

impl From<OutOfFrames> for SysError {
    fn from(_: OutOfFrames) -> Self {
        Self::OutOfMemory
    }
}

/// Reject addresses at or above the user/kernel split, and misaligned ones.
const fn check_addr(va: VirtAddr) -> Result<(), SysError> {
    if va.as_u32() >= USER_LIMIT || !va.is_page_aligned() {
        return Err(SysError::InvalidArgument);
    }
    Ok(())
}

/// Reject permission sets missing present+user or carrying bits outside the
/// user-grantable vocabulary.
const fn check_perms(perms: PageEntry) -> Result<(), SysError> {
    if !perms.covers(PageEntry::user_ro()) {
        return Err(SysError::InvalidArgument);
    }
    if perms.grantable().into_bits() != perms.into_bits() {
        return Err(SysError::InvalidArgument);
    }
    Ok(())
}

impl Kernel {
    /// The caller's full generation-stamped identity.
    ///
    /// # Errors
    /// [`SysError::BadEnv`] when the caller itself is not live.
    pub fn sys_getenvid(&self, caller: EnvId) -> Result<EnvId, SysError> {
        let slot = self.resolve(caller, EnvId::SELF, false)?;
        let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
        Ok(env.id)
    }

    /// Allocate a zeroed frame and map it at `va` in `target` with `perms`.
    ///
    /// If insertion fails after the frame was allocated, the frame is freed
    /// before the error is returned — no leak on the failure path.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`], [`SysError::BadEnv`] or
    /// [`SysError::OutOfMemory`] per the argument contract.
    pub fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
        perms: PageEntry,
    ) -> Result<(), SysError> {
        check_addr(va)?;
        check_perms(perms)?;
        let slot = self.resolve(caller, target, true)?;
        let frame = self.frames.alloc(true)?;
        let Self { frames, slots, .. } = self;
        let env = slots[slot].env.as_mut().ok_or(SysError::BadEnv)?;
        if let Err(exhausted) = env.space.insert(frames, frame, va, perms) {
            frames.free(frame);
            return Err(exhausted.into());
        }
        Ok(())
    }

    /// Map the frame at `src_va` in `src` additionally at `dst_va` in `dst`
    /// with `perms` — the sharing primitive underneath fork and COW.
    ///
    /// Beyond the address and flag checks, the source address must currently
    /// be mapped, and a writable request is refused against a read-only
    /// source mapping.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`], [`SysError::BadEnv`] or
    /// [`SysError::OutOfMemory`] per the argument contract.
    pub fn sys_page_map(
        &mut self,
        caller: EnvId,
        src: EnvId,
        src_va: VirtAddr,
        dst: EnvId,
        dst_va: VirtAddr,
        perms: PageEntry,
    ) -> Result<(), SysError> {
        check_addr(src_va)?;
        check_addr(dst_va)?;
        check_perms(perms)?;
        let src_slot = self.resolve(caller, src, true)?;
        let dst_slot = self.resolve(caller, dst, true)?;
        let src_env = self.slots[src_slot].env.as_ref().ok_or(SysError::BadEnv)?;
        let Some((frame, entry)) = src_env.space.lookup(&self.frames, src_va) else {
            return Err(SysError::InvalidArgument);
        };
        if perms.writable() && !entry.writable() {
            return Err(SysError::InvalidArgument);
        }
        let Self { frames, slots, .. } = self;
        let dst_env = slots[dst_slot].env.as_mut().ok_or(SysError::BadEnv)?;
        dst_env.space.insert(frames, frame, dst_va, perms)?;
        Ok(())
    }

    /// Unmap whatever is mapped at `va` in `target`. Succeeds silently when
    /// nothing is mapped there.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`] or [`SysError::BadEnv`].
    pub fn sys_page_unmap(
        &mut self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
    ) -> Result<(), SysError> {
        check_addr(va)?;
        let slot = self.resolve(caller, target, true)?;
        let Self { frames, slots, .. } = self;
        let env = slots[slot].env.as_mut().ok_or(SysError::BadEnv)?;
        env.space.remove(frames, va);
        Ok(())
    }

    /// Create a child environment: empty address space, the parent's saved
    /// trap context with the return register forced to zero, not runnable.
    ///
    /// The caller receives the child's identity; the child, when it
    /// eventually resumes from this very context, sees zero — the fork
    /// protocol's "I am the child" sentinel.
    ///
    /// # Errors
    /// [`SysError::BadEnv`] or [`SysError::OutOfMemory`].
    pub fn sys_exofork(&mut self, caller: EnvId) -> Result<EnvId, SysError> {
        let parent_slot = self.resolve(caller, EnvId::SELF, false)?;
        let parent_ctx = self.slots[parent_slot]
            .env
            .as_ref()
            .ok_or(SysError::BadEnv)?
            .ctx;
        let child = self.create_env(caller)?;
        if let Some(env) = self.slots[child.slot()].env.as_mut() {
            env.ctx = parent_ctx;
            env.ctx.ret = 0;
        }
        Ok(child)
    }

    /// Set `target`'s scheduling status to `Runnable` or `NotRunnable`.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`] for any other status,
    /// [`SysError::BadEnv`] per the authority rule.
    pub fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        target: EnvId,
        status: EnvStatus,
    ) -> Result<(), SysError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::InvalidArgument);
        }
        let slot = self.resolve(caller, target, true)?;
        if let Some(env) = self.slots[slot].env.as_mut() {
            env.status = status;
        }
        Ok(())
    }

    /// Install `target`'s fault upcall entry point. Installed once per
    /// environment lifetime in practice; re-installation simply replaces it.
    ///
    /// # Errors
    /// [`SysError::BadEnv`] per the authority rule.
    pub fn sys_env_set_fault_upcall(
        &mut self,
        caller: EnvId,
        target: EnvId,
        upcall: FaultUpcall,
    ) -> Result<(), SysError> {
        let slot = self.resolve(caller, target, true)?;
        if let Some(env) = self.slots[slot].env.as_mut() {
            env.upcall = Some(upcall);
        }
        Ok(())
    }

    /// Destroy `target`: tear down its entire address space and free its
    /// slot.
    ///
    /// # Errors
    /// [`SysError::BadEnv`] per the authority rule.
    pub fn sys_env_destroy(&mut self, caller: EnvId, target: EnvId) -> Result<(), SysError> {
        let slot = self.resolve(caller, target, true)?;
        if target == EnvId::SELF || target == caller {
            log::info!("[{caller}] exiting gracefully");
        } else {
            log::info!("[{caller}] destroying {target}");
        }
        self.env_free(slot);
        Ok(())
    }

    /// Read the permission flags mapped at `va` in `target`, or `None` when
    /// nothing is mapped there. The user-level protocols use this where real
    /// hardware would let them read their own page tables.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`] for an out-of-range address,
    /// [`SysError::BadEnv`] per the authority rule.
    pub fn sys_page_flags(
        &self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
    ) -> Result<Option<PageEntry>, SysError> {
        if va.as_u32() >= USER_LIMIT {
            return Err(SysError::InvalidArgument);
        }
        let slot = self.resolve(caller, target, true)?;
        let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
        Ok(env
            .space
            .lookup(&self.frames, va.page_base())
            .map(|(_, entry)| entry.perms()))
    }

    /// Whether the page *directory* entry covering `va` is present in
    /// `target` — lets a walk skip 4 MiB at a time.
    ///
    /// # Errors
    /// [`SysError::InvalidArgument`] for an out-of-range address,
    /// [`SysError::BadEnv`] per the authority rule.
    pub fn sys_page_dir_present(
        &self,
        caller: EnvId,
        target: EnvId,
        va: VirtAddr,
    ) -> Result<bool, SysError> {
        if va.as_u32() >= USER_LIMIT {
            return Err(SysError::InvalidArgument);
        }
        let slot = self.resolve(caller, target, true)?;
        let env = self.slots[slot].env.as_ref().ok_or(SysError::BadEnv)?;
        Ok(env.space.dir_present(&self.frames, va))
    }

    /// Print `len` bytes starting at `va` from the caller's memory to the
    /// console.
    ///
    /// The buffer is validated for present+user access before the kernel
    /// touches a byte of it; a violation terminates the caller rather than
    /// let the kernel dereference untrusted memory.
    ///
    /// # Errors
    /// [`SysError::BadEnv`], or [`SysError::AccessViolation`] after the
    /// caller has been terminated.
    pub fn sys_console_write(
        &mut self,
        caller: EnvId,
        va: VirtAddr,
        len: usize,
    ) -> Result<(), SysError> {
        let slot = self.resolve(caller, EnvId::SELF, false)?;
        if let Err(bad) = self.user_mem_check(slot, va, len, PageEntry::user_ro()) {
            log::warn!("[{caller}] bad buffer {bad} in console write, terminating");
            self.env_free(slot);
            return Err(SysError::AccessViolation(bad));
        }
        let bytes = self
            .copy_from_env(slot, va, len)
            .ok_or(SysError::AccessViolation(va))?;
        if let Ok(text) = core::str::from_utf8(&bytes) {
            log::info!("[{caller}] {text}");
        }
        self.console.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addresses::PAGE_SIZE;

    fn booted() -> (Kernel, EnvId) {
        let mut kernel = Kernel::new(256);
        let root = kernel.create_root_env().unwrap();
        (kernel, root)
    }

    #[test]
    fn alloc_rejects_bad_addresses_for_every_legal_flag_set() {
        let (mut kernel, root) = booted();
        let flag_sets = [
            PageEntry::user_ro(),
            PageEntry::user_rw(),
            PageEntry::user_cow(),
            PageEntry::user_rw().with_shared(true),
        ];
        for perms in flag_sets {
            assert_eq!(
                kernel.sys_page_alloc(root, EnvId::SELF, VirtAddr::new(USER_LIMIT), perms),
                Err(SysError::InvalidArgument)
            );
            assert_eq!(
                kernel.sys_page_alloc(root, EnvId::SELF, VirtAddr::new(0x1001), perms),
                Err(SysError::InvalidArgument)
            );
        }
    }

    #[test]
    fn alloc_rejects_illegal_permission_bits() {
        let (mut kernel, root) = booted();
        let va = VirtAddr::new(0x1000);
        // Missing the mandatory user bit.
        let kernel_only = PageEntry::new().with_present(true);
        assert_eq!(
            kernel.sys_page_alloc(root, EnvId::SELF, va, kernel_only),
            Err(SysError::InvalidArgument)
        );
        // Missing present.
        let absent = PageEntry::new().with_user(true);
        assert_eq!(
            kernel.sys_page_alloc(root, EnvId::SELF, va, absent),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn address_checks_precede_identity_resolution() {
        let (mut kernel, root) = booted();
        let bogus = EnvId::make(99, 63);
        // Both the identity and the address are bad; the address wins.
        assert_eq!(
            kernel.sys_page_alloc(root, bogus, VirtAddr::new(USER_LIMIT), PageEntry::user_rw()),
            Err(SysError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_page_unmap(root, bogus, VirtAddr::new(0x123)),
            Err(SysError::InvalidArgument)
        );
        // Good address, bad identity.
        assert_eq!(
            kernel.sys_page_alloc(root, bogus, VirtAddr::new(0x1000), PageEntry::user_rw()),
            Err(SysError::BadEnv)
        );
    }

    #[test]
    fn realloc_at_the_same_address_frees_the_old_frame() {
        let (mut kernel, root) = booted();
        let va = VirtAddr::new(0x0080_0000);
        kernel
            .sys_page_alloc(root, EnvId::SELF, va, PageEntry::user_rw())
            .unwrap();
        let old = kernel.frame_at(root, va).unwrap();
        assert_eq!(kernel.frames().refs(old), 1);

        kernel
            .sys_page_alloc(root, EnvId::SELF, va, PageEntry::user_rw())
            .unwrap();
        let new = kernel.frame_at(root, va).unwrap();
        assert_ne!(old, new);
        assert!(kernel.frames().is_free(old));
    }

    #[test]
    fn map_refuses_writable_over_a_read_only_source() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        let src = VirtAddr::new(0x1000);
        let dst = VirtAddr::new(0x2000);
        kernel
            .sys_page_alloc(root, EnvId::SELF, src, PageEntry::user_ro())
            .unwrap();
        assert_eq!(
            kernel.sys_page_map(root, EnvId::SELF, src, child, dst, PageEntry::user_rw()),
            Err(SysError::InvalidArgument)
        );
        // The target stays unmapped and the source frame count is untouched.
        assert!(kernel.frame_at(child, dst).is_none());
        let frame = kernel.frame_at(root, src).unwrap();
        assert_eq!(kernel.frames().refs(frame), 1);
    }

    #[test]
    fn map_shares_one_frame_and_adds_exactly_one_reference() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        let src = VirtAddr::new(0x1000);
        let dst = VirtAddr::new(0x0050_0000);
        kernel
            .sys_page_alloc(root, EnvId::SELF, src, PageEntry::user_rw())
            .unwrap();
        let frame = kernel.frame_at(root, src).unwrap();
        kernel
            .sys_page_map(root, EnvId::SELF, src, child, dst, PageEntry::user_ro())
            .unwrap();
        assert_eq!(kernel.frame_at(child, dst), Some(frame));
        assert_eq!(kernel.frames().refs(frame), 2);
    }

    #[test]
    fn map_from_an_unmapped_source_is_rejected() {
        let (mut kernel, root) = booted();
        assert_eq!(
            kernel.sys_page_map(
                root,
                EnvId::SELF,
                VirtAddr::new(0x7000),
                EnvId::SELF,
                VirtAddr::new(0x8000),
                PageEntry::user_ro()
            ),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn unmap_of_an_unmapped_address_is_a_silent_success() {
        let (mut kernel, root) = booted();
        let free_before = kernel.frames().free_frames();
        assert_eq!(
            kernel.sys_page_unmap(root, EnvId::SELF, VirtAddr::new(0x4000)),
            Ok(())
        );
        assert_eq!(kernel.frames().free_frames(), free_before);
    }

    #[test]
    fn exofork_child_starts_not_runnable_with_zero_return() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        assert_eq!(kernel.env_status(child), Some(EnvStatus::NotRunnable));
        assert_eq!(kernel.saved_context(child).unwrap().ret, 0);
        // And the parent may promote it.
        kernel
            .sys_env_set_status(root, child, EnvStatus::Runnable)
            .unwrap();
        assert_eq!(kernel.env_status(child), Some(EnvStatus::Runnable));
    }

    #[test]
    fn set_status_rejects_running() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        assert_eq!(
            kernel.sys_env_set_status(root, child, EnvStatus::Running),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn destroy_returns_every_frame_of_the_target() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        let free_before = kernel.frames().free_frames();
        for page in 0..4u32 {
            kernel
                .sys_page_alloc(
                    root,
                    child,
                    VirtAddr::new(0x1000 + page * PAGE_SIZE),
                    PageEntry::user_rw(),
                )
                .unwrap();
        }
        kernel.sys_env_destroy(root, child).unwrap();
        // Leaves, the page table and the directory all came back, plus the
        // directory allocated at exofork time.
        assert_eq!(kernel.frames().free_frames(), free_before + 1);
    }

    #[test]
    fn console_write_copies_validated_bytes() {
        let (mut kernel, root) = booted();
        let va = VirtAddr::new(0x1000);
        kernel
            .sys_page_alloc(root, EnvId::SELF, va, PageEntry::user_rw())
            .unwrap();
        kernel.user_write(root, va, b"hello console").unwrap();
        kernel.sys_console_write(root, va, 13).unwrap();
        assert_eq!(kernel.console(), b"hello console");
    }

    #[test]
    fn console_write_with_a_bad_buffer_terminates_the_caller() {
        let (mut kernel, root) = booted();
        let child = kernel.sys_exofork(root).unwrap();
        let unmapped = VirtAddr::new(0x9000);
        assert_eq!(
            kernel.sys_console_write(child, unmapped, 16),
            Err(SysError::AccessViolation(unmapped))
        );
        assert!(kernel.env_status(child).is_none());
    }

    #[test]
    fn page_flags_reports_the_convention_bits() {
        let (mut kernel, root) = booted();
        let va = VirtAddr::new(0x3000);
        kernel
            .sys_page_alloc(root, EnvId::SELF, va, PageEntry::user_cow())
            .unwrap();
        let flags = kernel.sys_page_flags(root, EnvId::SELF, va).unwrap().unwrap();
        assert!(flags.cow() && !flags.writable());
        assert_eq!(kernel.sys_page_flags(root, EnvId::SELF, VirtAddr::new(0x5000)), Ok(None));
    }

    #[test]
    fn dir_present_skips_unbacked_spans() {
        let (mut kernel, root) = booted();
        kernel
            .sys_page_alloc(root, EnvId::SELF, VirtAddr::new(0x1000), PageEntry::user_rw())
            .unwrap();
        assert!(kernel
            .sys_page_dir_present(root, EnvId::SELF, VirtAddr::new(0x2000))
            .unwrap());
        assert!(!kernel
            .sys_page_dir_present(root, EnvId::SELF, VirtAddr::new(0x1000_0000))
            .unwrap());
    }
}
