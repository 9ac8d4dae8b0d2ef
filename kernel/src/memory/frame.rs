//! Physical page frame descriptors.
//!
//! Every physical frame in the system has one `Frame` here, indexed by
//! PFN. The descriptor carries the bookkeeping the buddy allocator and
//! page-table engine both need: a refcount, the split page-table lock
//! (used only when the frame backs a page table), its zone/node, and its
//! free-list linkage when it is on a buddy free list.
//!
//! Mirrors the role of the teacher's `memory::pmm` bitmap (one bit per
//! frame) but carries enough per-frame state for buddy coalescing and
//! for acting as the split lock named in the page-table engine.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sync::spinlock::SpinLock;

/// Zone classification, used to satisfy DMA-range allocation constraints
/// and to keep buddy free-lists from spanning memory-controller regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneKind {
    /// PFN range reachable by legacy 24-bit DMA (< 16 MiB).
    Dma = 0,
    /// PFN range reachable by 32-bit DMA (< 4 GiB).
    Dma32 = 1,
    /// Everything else.
    Normal = 2,
}

impl ZoneKind {
    pub const COUNT: usize = 3;

    pub fn for_phys_addr(phys: u64) -> Self {
        if phys < 16 * 1024 * 1024 {
            ZoneKind::Dma
        } else if phys < 4 * 1024 * 1024 * 1024 {
            ZoneKind::Dma32
        } else {
            ZoneKind::Normal
        }
    }
}

/// What kind of allocation a frame serves, for future anti-fragmentation
/// grouping (movable pages cluster away from unmovable kernel structures).
/// Only `Unmovable` is actually produced by this core — `alloc_pages`
/// always hands out kernel-owned memory — but the field is present so the
/// invariant in spec.md's data model ("migration type") has somewhere to
/// live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrateType {
    Unmovable = 0,
    Movable = 1,
    Reclaimable = 2,
}

/// Sentinel free-list link meaning "end of list" / "not on a free list".
pub const FRAME_LIST_NONE: u32 = u32::MAX;

/// Failure mode for every frame-allocating entry point in `memory::buddy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block of the requested order exists in any eligible zone.
    OutOfMemory,
}

/// Per-frame descriptor.
///
/// `lock` is the split page-table lock: when this frame backs a page
/// table, every mutation of its 512 entries happens under this lock, and
/// higher levels are walked lock-free with acquire loads (see
/// `memory::pagetable`).
pub struct Frame {
    pub(super) refcount: AtomicU32,
    pub(super) lock: SpinLock<()>,
    pub(super) zone: ZoneKind,
    pub(super) node: u8,
    /// Buddy order this frame is the head of, while free. `-1` if the
    /// frame is allocated, reserved, or not the block head.
    pub(super) order: i8,
    pub(super) migrate_type: MigrateType,
    /// Index (PFN, relative to the table base) of the next frame on the
    /// same free list, or `FRAME_LIST_NONE`.
    pub(super) free_next: u32,
}

impl Frame {
    pub const fn reserved() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            lock: SpinLock::new(()),
            zone: ZoneKind::Normal,
            node: 0,
            order: -1,
            migrate_type: MigrateType::Unmovable,
            free_next: FRAME_LIST_NONE,
        }
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Invariant (spec.md §3): a frame is on exactly one free list iff its
    /// refcount is zero and it is not reserved.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.order >= 0
    }

    #[inline]
    pub fn inc_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the refcount and returns the new value. The caller frees
    /// the frame back to the buddy allocator when this reaches zero.
    #[inline]
    pub fn dec_ref(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "Frame::dec_ref underflow");
        prev - 1
    }

    /// Acquire this frame's split page-table lock. Only meaningful when
    /// the frame backs a page table; callers elsewhere (buddy metadata)
    /// don't take it.
    #[inline]
    pub fn table_lock(&self) -> crate::sync::spinlock::SpinLockGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn zone(&self) -> ZoneKind {
        self.zone
    }

    pub fn node(&self) -> u8 {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries_match_dma_limits() {
        assert_eq!(ZoneKind::for_phys_addr(0), ZoneKind::Dma);
        assert_eq!(ZoneKind::for_phys_addr(16 * 1024 * 1024 - 1), ZoneKind::Dma);
        assert_eq!(ZoneKind::for_phys_addr(16 * 1024 * 1024), ZoneKind::Dma32);
        assert_eq!(ZoneKind::for_phys_addr(4 * 1024 * 1024 * 1024 - 1), ZoneKind::Dma32);
        assert_eq!(ZoneKind::for_phys_addr(4 * 1024 * 1024 * 1024), ZoneKind::Normal);
    }

    #[test]
    fn reserved_frame_is_not_free() {
        let frame = Frame::reserved();
        assert!(!frame.is_free());
        assert_eq!(frame.refcount(), 0);
    }

    #[test]
    fn refcount_round_trips() {
        let frame = Frame::reserved();
        assert_eq!(frame.inc_ref(), 1);
        assert_eq!(frame.inc_ref(), 2);
        assert_eq!(frame.dec_ref(), 1);
        assert_eq!(frame.dec_ref(), 0);
    }
}
