use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_addresses::PAGE_SIZE;

/// One frame's worth of backing storage.
pub const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Sentinel terminating the intrusive free list.
const NO_FRAME: u32 = u32::MAX;

/// Stable handle identifying one physical frame.
///
/// Handles are plain indices into the arena; they stay valid for the lifetime
/// of the arena regardless of how often the frame is mapped, unmapped, or
/// recycled through the free list.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// Per-frame bookkeeping.
///
/// The reference count is atomic so that an increment or decrement can never
/// be observed half-done by a timer-driven switch into another environment
/// sharing the same frame; the free-list link is only touched with the arena
/// borrowed mutably and needs no such protection.
struct FrameDescriptor {
    refs: AtomicU32,
    /// Next free frame; meaningful only while `free` is set.
    next_free: u32,
    free: bool,
}

/// Allocation failure: the free list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of physical frames")]
pub struct OutOfFrames;

/// All physical frames, their descriptors, and the free list.
///
/// Constructed once at startup and passed by reference to every consumer;
/// there is no ambient global allocator state.
pub struct FrameArena {
    descriptors: Vec<FrameDescriptor>,
    storage: Vec<Box<[u8; FRAME_BYTES]>>,
    free_head: u32,
    free_count: usize,
}

impl FrameArena {
    /// Build an arena covering `frame_count` physical frames.
    ///
    /// Frame 0 models the boot/kernel reserve and is permanently excluded
    /// from the free list; every other frame starts free with a zero count.
    ///
    /// # Panics
    /// If `frame_count < 2` (nothing would be allocatable).
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count >= 2, "arena needs at least one allocatable frame");
        let mut descriptors = Vec::with_capacity(frame_count);
        let mut storage = Vec::with_capacity(frame_count);

        descriptors.push(FrameDescriptor {
            refs: AtomicU32::new(0),
            next_free: NO_FRAME,
            free: false,
        });
        storage.push(Box::new([0u8; FRAME_BYTES]));

        // Build the free list in ascending order: each frame links to the
        // next, the last links to the sentinel.
        for i in 1..frame_count {
            let next = if i + 1 < frame_count {
                (i + 1) as u32
            } else {
                NO_FRAME
            };
            descriptors.push(FrameDescriptor {
                refs: AtomicU32::new(0),
                next_free: next,
                free: true,
            });
            storage.push(Box::new([0u8; FRAME_BYTES]));
        }

        Self {
            descriptors,
            storage,
            free_head: 1,
            free_count: frame_count - 1,
        }
    }

    /// Total number of frames, including the reserved frame 0.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Number of frames currently on the free list.
    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Take one frame off the free list.
    ///
    /// The returned frame has a reference count of zero; it is the caller's
    /// job to map it (which increments the count) or to [`free`](Self::free)
    /// it again on a failure path. When `zero` is set the contents are
    /// cleared before the handle is returned.
    ///
    /// # Errors
    /// [`OutOfFrames`] when the free list is empty.
    pub fn alloc(&mut self, zero: bool) -> Result<FrameId, OutOfFrames> {
        let head = self.free_head;
        if head == NO_FRAME {
            log::warn!("frame allocator exhausted ({} frames total)", self.frame_count());
            return Err(OutOfFrames);
        }
        let desc = &mut self.descriptors[head as usize];
        debug_assert!(desc.free);
        debug_assert_eq!(desc.refs.load(Ordering::Acquire), 0);
        self.free_head = desc.next_free;
        desc.free = false;
        desc.next_free = NO_FRAME;
        self.free_count -= 1;
        if zero {
            self.storage[head as usize].fill(0);
        }
        Ok(FrameId(head))
    }

    /// Return a frame to the free list.
    ///
    /// # Panics
    /// If the frame is already free or its reference count is non-zero —
    /// both indicate a bug in the caller, not a recoverable condition.
    pub fn free(&mut self, frame: FrameId) {
        let head = self.free_head;
        let desc = self.descriptor_mut(frame);
        assert!(!desc.free, "double free of {frame:?}");
        assert_eq!(
            desc.refs.load(Ordering::Acquire),
            0,
            "freeing {frame:?} with live references"
        );
        desc.free = true;
        desc.next_free = head;
        self.free_head = frame.0;
        self.free_count += 1;
    }

    /// Record one more mapping of `frame`.
    pub fn inc_ref(&mut self, frame: FrameId) {
        let desc = self.descriptor(frame);
        debug_assert!(!desc.free, "referencing free {frame:?}");
        desc.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one fewer mapping of `frame`; frees it when the last mapping
    /// is gone.
    ///
    /// # Panics
    /// If the count is already zero.
    pub fn dec_ref(&mut self, frame: FrameId) {
        let desc = self.descriptor(frame);
        let previous = desc.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "reference underflow on {frame:?}");
        if previous == 1 {
            self.free(frame);
        }
    }

    /// Current reference count of `frame`.
    #[inline]
    #[must_use]
    pub fn refs(&self, frame: FrameId) -> u32 {
        self.descriptor(frame).refs.load(Ordering::Acquire)
    }

    /// Whether `frame` currently sits on the free list.
    #[inline]
    #[must_use]
    pub fn is_free(&self, frame: FrameId) -> bool {
        self.descriptor(frame).free
    }

    /// Backing storage of `frame`.
    #[inline]
    #[must_use]
    pub fn bytes(&self, frame: FrameId) -> &[u8; FRAME_BYTES] {
        assert!(frame.index() < self.storage.len(), "{frame:?} out of range");
        &self.storage[frame.index()]
    }

    /// Mutable backing storage of `frame`.
    #[inline]
    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8; FRAME_BYTES] {
        assert!(frame.index() < self.storage.len(), "{frame:?} out of range");
        &mut self.storage[frame.index()]
    }

    fn descriptor(&self, frame: FrameId) -> &FrameDescriptor {
        assert!(
            frame.index() < self.descriptors.len(),
            "{frame:?} out of range"
        );
        &self.descriptors[frame.index()]
    }

    fn descriptor_mut(&mut self, frame: FrameId) -> &mut FrameDescriptor {
        assert!(
            frame.index() < self.descriptors.len(),
            "{frame:?} out of range"
        );
        &mut self.descriptors[frame.index()]
    }
}
