//! # User-Level Fork
//!
//! Process duplication without kernel knowledge of "fork" as a concept: the
//! parent walks its own address space through the syscall surface and
//! replicates every mapping into a freshly created child, marking writable
//! pages copy-on-write on *both* sides. The installed fault handler then
//! resolves the first write to any such page by copying it — so the cost of
//! a page is paid only when somebody actually writes to it.
//!
//! Everything here runs at user level. The kernel contributes exactly three
//! things: the syscall surface, fault delivery to the installed handler, and
//! the two convention bits (`cow`, `shared`) it stores but never interprets.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel::{EnvId, EnvStatus, FaultRecord, Kernel, SysError, UpcallFailed};
use kernel_addresses::{PAGE_SIZE, PAGE_TABLE_SPAN, VirtAddr, VirtPage};
use kernel_info::memory::{FAULT_STACK_PAGE, FAULT_STACK_TOP, SCRATCH_PAGE, USER_LIMIT, USER_STACK_TOP};
use kernel_vmem::PageEntry;

/// The calling environment's view of the world: its identity plus the
/// syscall surface. All wrappers pass `self.id` as the caller.
pub struct UserEnv<'k> {
    kernel: &'k mut Kernel,
    id: EnvId,
}

impl<'k> UserEnv<'k> {
    #[must_use]
    pub fn new(kernel: &'k mut Kernel, id: EnvId) -> Self {
        Self { kernel, id }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> EnvId {
        self.id
    }

    fn getenvid(&self) -> Result<EnvId, SysError> {
        self.kernel.sys_getenvid(self.id)
    }

    fn page_alloc(&mut self, target: EnvId, va: VirtAddr, perms: PageEntry) -> Result<(), SysError> {
        self.kernel.sys_page_alloc(self.id, target, va, perms)
    }

    /// Map this environment's page at `src_va` into `target` at `dst_va`.
    fn page_map(
        &mut self,
        src_va: VirtAddr,
        target: EnvId,
        dst_va: VirtAddr,
        perms: PageEntry,
    ) -> Result<(), SysError> {
        self.kernel
            .sys_page_map(self.id, EnvId::SELF, src_va, target, dst_va, perms)
    }

    fn page_unmap(&mut self, va: VirtAddr) -> Result<(), SysError> {
        self.kernel.sys_page_unmap(self.id, EnvId::SELF, va)
    }

    /// Permission flags at `va` in this environment's own tables — the
    /// syscall stand-in for reading the user-visible page-table window.
    fn page_flags(&self, va: VirtAddr) -> Result<Option<PageEntry>, SysError> {
        self.kernel.sys_page_flags(self.id, EnvId::SELF, va)
    }

    fn dir_present(&self, va: VirtAddr) -> Result<bool, SysError> {
        self.kernel.sys_page_dir_present(self.id, EnvId::SELF, va)
    }

    fn copy_page(&mut self, src: VirtAddr, dst: VirtAddr) -> Result<(), SysError> {
        self.kernel.user_copy(self.id, src, dst, PAGE_SIZE as usize)
    }
}

/// Why the COW handler could not repair a fault. Any of these is fatal to
/// the faulting environment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CowFaultError {
    /// The fault was a read or execute access; nothing to copy.
    #[error("fault was not a write")]
    NotAWrite,

    /// The faulting page is not marked copy-on-write.
    #[error("faulting page is not copy-on-write")]
    NotCow,

    /// A syscall inside the repair sequence failed.
    #[error("syscall failed during copy: {0}")]
    Syscall(#[from] SysError),
}

impl CowFaultError {
    const fn reason(self) -> &'static str {
        match self {
            Self::NotAWrite => "fault was not a write",
            Self::NotCow => "faulting page is not copy-on-write",
            Self::Syscall(_) => "syscall failed during copy",
        }
    }
}

/// A fork failing partway through. The half-built child has never been
/// marked runnable and is simply abandoned.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("fork failed during {step}: {cause}")]
pub struct ForkError {
    pub step: &'static str,
    pub cause: SysError,
}

/// The upcall entry point registered with the kernel. Adapts the fault
/// record to [`handle_cow_fault`] and folds its error into the delivery
/// contract's failure shape.
pub fn cow_upcall(kernel: &mut Kernel, id: EnvId, record: &FaultRecord) -> Result<(), UpcallFailed> {
    let mut env = UserEnv::new(kernel, id);
    handle_cow_fault(&mut env, record).map_err(|fault| UpcallFailed {
        reason: fault.reason(),
    })
}

/// Repair a write fault on a copy-on-write page.
///
/// The faulting environment allocates a fresh page at the fixed scratch
/// address, copies the shared page's contents into it, maps the copy over
/// the faulting address writable (dropping its own reference to the shared
/// frame), and unmaps the scratch address. Siblings still sharing the
/// original frame never notice.
///
/// # Errors
/// [`CowFaultError`] when the fault is not a COW write or a syscall in the
/// sequence fails; the caller treats every case as fatal.
pub fn handle_cow_fault(env: &mut UserEnv<'_>, record: &FaultRecord) -> Result<(), CowFaultError> {
    if !record.err.write() {
        return Err(CowFaultError::NotAWrite);
    }
    let page = record.va.page_base();
    let flags = env.page_flags(page)?.ok_or(CowFaultError::NotCow)?;
    if !flags.cow() {
        return Err(CowFaultError::NotCow);
    }

    let scratch = VirtAddr::new(SCRATCH_PAGE);
    env.page_alloc(EnvId::SELF, scratch, PageEntry::user_rw())?;
    env.copy_page(page, scratch)?;
    env.page_map(scratch, EnvId::SELF, page, PageEntry::user_rw())?;
    env.page_unmap(scratch)?;
    Ok(())
}

/// Install the COW fault handler: a dedicated handler-stack page (allocated
/// once; an already-present stack is left alone) and the upcall entry point.
///
/// # Errors
/// Propagates the underlying syscall failure.
pub fn install_fault_handler(env: &mut UserEnv<'_>) -> Result<(), SysError> {
    let stack = VirtAddr::new(FAULT_STACK_PAGE);
    if env.page_flags(stack)?.is_none() {
        env.page_alloc(EnvId::SELF, stack, PageEntry::user_rw())?;
    }
    env.kernel
        .sys_env_set_fault_upcall(env.id, EnvId::SELF, cow_upcall)
}

/// Replicate the parent's mapping at `va` into `child` per the sharing
/// policy:
///
/// - `shared` pages map identically (true sharing);
/// - writable or already-COW pages map COW into the child **and** are
///   re-mapped COW over the parent, so neither side can mutate the frame
///   out from under the other;
/// - plain read-only pages map read-only, no COW bit needed.
fn duppage(env: &mut UserEnv<'_>, child: EnvId, va: VirtAddr) -> Result<(), SysError> {
    let Some(flags) = env.page_flags(va)? else {
        return Ok(());
    };
    if flags.shared() {
        env.page_map(va, child, va, flags.grantable())?;
    } else if flags.writable() || flags.cow() {
        let cow = PageEntry::user_cow();
        // Child first; the parent flips to COW only once the child holds
        // its mapping.
        env.page_map(va, child, va, cow)?;
        env.page_map(va, EnvId::SELF, va, cow)?;
    } else {
        env.page_map(va, child, va, PageEntry::user_ro())?;
    }
    Ok(())
}

/// Duplicate the calling environment.
///
/// Returns the child's identity to the parent; the child, resuming from the
/// saved context with a zeroed return register, observes the
/// [`EnvId::SELF`] sentinel and takes the early exit at step 3.
///
/// # Errors
/// [`ForkError`] naming the step that failed. No rollback is attempted: a
/// half-duplicated child was never marked runnable and is abandoned.
pub fn fork(env: &mut UserEnv<'_>) -> Result<EnvId, ForkError> {
    let fail = |step: &'static str| move |cause: SysError| ForkError { step, cause };

    install_fault_handler(env).map_err(fail("handler install"))?;

    let child = env.kernel.sys_exofork(env.id).map_err(fail("exofork"))?;
    if child == EnvId::SELF {
        // We are the child, resumed from the saved context: our identity
        // record is not the one the parent's stack frame holds.
        env.getenvid().map_err(fail("identity refresh"))?;
        return Ok(EnvId::SELF);
    }

    env.kernel
        .sys_env_set_fault_upcall(env.id, child, cow_upcall)
        .map_err(fail("child handler install"))?;

    // Everything below the user stack top, skipping 4 MiB at a time where
    // no page table exists.
    let mut span_base = 0_u32;
    while span_base < USER_STACK_TOP {
        if !env
            .dir_present(VirtAddr::new(span_base))
            .map_err(fail("directory probe"))?
        {
            span_base += PAGE_TABLE_SPAN;
            continue;
        }
        let span_end = (span_base + PAGE_TABLE_SPAN).min(USER_STACK_TOP);
        for page in VirtPage::span(VirtAddr::new(span_base), VirtAddr::new(span_end)) {
            duppage(env, child, page.base()).map_err(fail("page duplication"))?;
        }
        span_base += PAGE_TABLE_SPAN;
    }

    // The child gets its own private handler stack, never shared or COW.
    env.page_alloc(child, VirtAddr::new(FAULT_STACK_PAGE), PageEntry::user_rw())
        .map_err(fail("child handler stack"))?;

    // The trampoline region maps identically: kernel-installed, read-only.
    for page in VirtPage::span(VirtAddr::new(FAULT_STACK_TOP), VirtAddr::new(USER_LIMIT)) {
        let va = page.base();
        if let Some(flags) = env.page_flags(va).map_err(fail("trampoline probe"))? {
            env.page_map(va, child, va, flags.grantable())
                .map_err(fail("trampoline share"))?;
        }
    }

    env.kernel
        .sys_env_set_status(env.id, child, EnvStatus::Runnable)
        .map_err(fail("child promotion"))?;
    Ok(child)
}
