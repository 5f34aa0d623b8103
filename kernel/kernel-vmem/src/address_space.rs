//! A single environment's two-level page-table tree.
//!
//! The directory and every page table live in ordinary refcounted frames, so
//! table storage is accounted for exactly like mapped pages. All entry access
//! goes through explicit (frame, index) addressing into the arena.

use crate::page_entry::PageEntry;
use crate::tlb::Tlb;
use kernel_addresses::{ENTRIES_PER_TABLE, VirtAddr};
use kernel_frames::{FrameArena, FrameId, OutOfFrames};

const ENTRY_BYTES: usize = size_of::<u32>();

/// Read entry `index` of the table stored in `table`.
fn read_entry(frames: &FrameArena, table: FrameId, index: usize) -> PageEntry {
    debug_assert!(index < ENTRIES_PER_TABLE);
    let at = index * ENTRY_BYTES;
    let bytes = frames.bytes(table);
    let raw = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    PageEntry::from_bits(raw)
}

/// Write entry `index` of the table stored in `table`.
fn write_entry(frames: &mut FrameArena, table: FrameId, index: usize, entry: PageEntry) {
    debug_assert!(index < ENTRIES_PER_TABLE);
    let at = index * ENTRY_BYTES;
    frames.bytes_mut(table)[at..at + ENTRY_BYTES].copy_from_slice(&entry.into_bits().to_le_bytes());
}

/// Location of one leaf entry: which table frame, which slot.
#[derive(Copy, Clone, Debug)]
pub struct EntryRef {
    table: FrameId,
    index: usize,
}

impl EntryRef {
    /// Current value of the entry.
    #[must_use]
    pub fn read(self, frames: &FrameArena) -> PageEntry {
        read_entry(frames, self.table, self.index)
    }

    fn write(self, frames: &mut FrameArena, entry: PageEntry) {
        write_entry(frames, self.table, self.index, entry);
    }
}

/// One environment's address space, rooted at its page-directory frame.
///
/// Exclusively owned by its environment; the kernel borrows it only while
/// validating or mutating mappings on that environment's behalf.
pub struct AddressSpace {
    root: FrameId,
    tlb: Tlb,
}

impl AddressSpace {
    /// Allocate a zeroed root directory frame and wrap it.
    ///
    /// # Errors
    /// [`OutOfFrames`] when no frame is available for the directory.
    pub fn new(frames: &mut FrameArena) -> Result<Self, OutOfFrames> {
        let root = frames.alloc(true)?;
        frames.inc_ref(root);
        Ok(Self {
            root,
            tlb: Tlb::new(),
        })
    }

    /// The page-directory frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> FrameId {
        self.root
    }

    /// The translation-cache model for this space.
    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Whether the directory entry covering `va` is present, i.e. whether a
    /// page table exists for that 4 MiB span.
    #[must_use]
    pub fn dir_present(&self, frames: &FrameArena, va: VirtAddr) -> bool {
        read_entry(frames, self.root, va.dir_index()).present()
    }

    /// Descend to the leaf entry slot for `va` without allocating.
    ///
    /// `None` when the intermediate table does not exist; an existing slot is
    /// returned whether or not its entry is present.
    #[must_use]
    pub fn walk(&self, frames: &FrameArena, va: VirtAddr) -> Option<EntryRef> {
        let dir = read_entry(frames, self.root, va.dir_index());
        dir.present().then(|| EntryRef {
            table: dir.frame_id(),
            index: va.table_index(),
        })
    }

    /// Descend to the leaf entry slot for `va`, allocating and linking a
    /// zeroed page table when the directory slot is empty.
    ///
    /// The fresh table frame is refcounted like any other frame.
    ///
    /// # Errors
    /// [`OutOfFrames`] when a table frame is needed and none is available.
    pub fn walk_create(
        &mut self,
        frames: &mut FrameArena,
        va: VirtAddr,
    ) -> Result<EntryRef, OutOfFrames> {
        let dir_index = va.dir_index();
        let dir = read_entry(frames, self.root, dir_index);
        let table = if dir.present() {
            dir.frame_id()
        } else {
            let table = frames.alloc(true)?;
            frames.inc_ref(table);
            write_entry(
                frames,
                self.root,
                dir_index,
                PageEntry::user_rw().with_frame_id(table),
            );
            table
        };
        Ok(EntryRef {
            table,
            index: va.table_index(),
        })
    }

    /// Map `frame` at `va` with `perms`.
    ///
    /// `va` must be page-aligned (the caller's responsibility — validation
    /// happens one layer up). An existing mapping of a *different* frame is
    /// dropped first, decrementing that frame's count and freeing it at
    /// zero; re-inserting the frame already mapped here leaves its count
    /// unchanged. The translation cache entry for the page is invalidated.
    ///
    /// # Errors
    /// [`OutOfFrames`] only when an intermediate table frame could not be
    /// allocated.
    pub fn insert(
        &mut self,
        frames: &mut FrameArena,
        frame: FrameId,
        va: VirtAddr,
        perms: PageEntry,
    ) -> Result<(), OutOfFrames> {
        debug_assert!(va.is_page_aligned());
        let slot = self.walk_create(frames, va)?;
        // Bump the incoming frame before dropping the old mapping, so
        // re-inserting the same frame cannot transiently hit a zero count.
        frames.inc_ref(frame);
        let old = slot.read(frames);
        if old.present() {
            frames.dec_ref(old.frame_id());
        }
        slot.write(frames, perms.with_present(true).with_frame_id(frame));
        self.tlb.invalidate(va.page());
        Ok(())
    }

    /// Unmap whatever is mapped at `va`.
    ///
    /// A no-op when nothing is mapped there (and therefore idempotent).
    /// Otherwise clears the entry, decrements the frame's count (freeing at
    /// zero) and invalidates the translation cache for the page.
    pub fn remove(&mut self, frames: &mut FrameArena, va: VirtAddr) {
        let Some(slot) = self.walk(frames, va) else {
            return;
        };
        let old = slot.read(frames);
        if !old.present() {
            return;
        }
        slot.write(frames, PageEntry::new());
        frames.dec_ref(old.frame_id());
        self.tlb.invalidate(va.page());
    }

    /// Read-only translation of `va`: the mapped frame and the full entry.
    ///
    /// Never allocates intermediate tables.
    #[must_use]
    pub fn lookup(&self, frames: &FrameArena, va: VirtAddr) -> Option<(FrameId, PageEntry)> {
        let entry = self.walk(frames, va)?.read(frames);
        entry.present().then(|| (entry.frame_id(), entry))
    }

    /// Tear the whole tree down: every leaf mapping is removed, every page
    /// table and finally the directory are released.
    ///
    /// The space must not be used afterwards; callers drop it immediately.
    pub fn teardown(&mut self, frames: &mut FrameArena) {
        for dir_index in 0..ENTRIES_PER_TABLE {
            let dir = read_entry(frames, self.root, dir_index);
            if !dir.present() {
                continue;
            }
            let table = dir.frame_id();
            for index in 0..ENTRIES_PER_TABLE {
                let entry = read_entry(frames, table, index);
                if entry.present() {
                    write_entry(frames, table, index, PageEntry::new());
                    frames.dec_ref(entry.frame_id());
                }
            }
            write_entry(frames, self.root, dir_index, PageEntry::new());
            frames.dec_ref(table);
        }
        frames.dec_ref(self.root);
    }
}
