//! Buddy physical frame allocator with NUMA-zone free lists.
//!
//! Supersedes `memory::pmm`'s flat bitmap with order-0..=MAX_ORDER free
//! lists per (node, zone), so callers can request power-of-two runs
//! (huge-page backing, DMA buffers) without a bitmap's linear contiguous
//! scan. Frame bookkeeping lives in `memory::frame::Frame`, one entry per
//! physical page frame, laid out exactly the way the bitmap was in
//! `memory::pmm`: a bootstrap pass finds a USABLE region in the Limine
//! memory map big enough to hold the table, before the heap exists to
//! allocate it from.
//!
//! NUMA support is structural only for now: there is no SRAT parser, so
//! every frame is assigned to node 0. `MAX_NODES` stays at 1 until ACPI
//! table parsing lands; the zone/order arrays are already indexed by node
//! so turning on a second node is a matter of filling `frame.node`
//! correctly during init, not reworking the allocator.

use core::mem::size_of;
use core::ptr;

use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::memory::frame::{AllocError, Frame, ZoneKind, FRAME_LIST_NONE};
use crate::sync::spinlock::SpinLock;

/// Largest block size the allocator hands out: 2^10 * 4 KiB = 4 MiB.
/// Covers both 4 KiB and 2 MiB (order 9) page-table leaf sizes.
pub const MAX_ORDER: usize = 10;

/// Number of NUMA nodes tracked. See module docs: fixed at 1 until SRAT
/// parsing exists.
pub const MAX_NODES: usize = 1;

#[derive(Clone, Copy)]
struct FrameTableInfo {
    base: *mut Frame,
    len: usize,
}
unsafe impl Send for FrameTableInfo {}

static FRAME_TABLE: SpinLock<Option<FrameTableInfo>> = SpinLock::new(None);

struct FreeLists {
    /// `heads[node][zone][order]` is the PFN at the head of that free
    /// list, or `FRAME_LIST_NONE`.
    heads: [[[u32; MAX_ORDER + 1]; ZoneKind::COUNT]; MAX_NODES],
    free_count: [[[u64; MAX_ORDER + 1]; ZoneKind::COUNT]; MAX_NODES],
}

static FREE_LISTS: SpinLock<FreeLists> = SpinLock::new(FreeLists {
    heads: [[[FRAME_LIST_NONE; MAX_ORDER + 1]; ZoneKind::COUNT]; MAX_NODES],
    free_count: [[[0; MAX_ORDER + 1]; ZoneKind::COUNT]; MAX_NODES],
});

/// Snapshot of buddy allocator usage, for boot-time reporting.
#[derive(Debug, Clone, Copy)]
pub struct BuddyStats {
    pub total_frames: usize,
    pub free_frames: u64,
}

fn table_info() -> FrameTableInfo {
    FRAME_TABLE
        .lock()
        .as_ref()
        .copied()
        .expect("buddy: not initialized — call buddy::init() first")
}

/// Initializes the buddy allocator from the Limine memory map.
///
/// Must run once, early, single-core, before any allocation.
///
/// # Panics
/// - If called more than once.
/// - If no USABLE region is large enough to hold the frame table.
pub fn init(memory_map: &[&limine::memory_map::Entry]) {
    {
        let guard = FRAME_TABLE.lock();
        assert!(guard.is_none(), "buddy: init called more than once");
    }

    let mut highest_addr: u64 = 0;
    for entry in memory_map {
        let dominated = matches!(
            entry.entry_type,
            limine::memory_map::EntryType::USABLE
                | limine::memory_map::EntryType::BOOTLOADER_RECLAIMABLE
                | limine::memory_map::EntryType::ACPI_RECLAIMABLE
                | limine::memory_map::EntryType::EXECUTABLE_AND_MODULES
                | limine::memory_map::EntryType::FRAMEBUFFER
        );
        if dominated {
            let end = entry.base + entry.length;
            if end > highest_addr {
                highest_addr = end;
            }
        }
    }

    let total_frames = (highest_addr / PAGE_SIZE) as usize;
    let table_bytes = total_frames * size_of::<Frame>();
    let table_frame_count = (table_bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

    kprintln!(
        "[buddy] tracking {} frames, frame table = {} bytes ({} pages)",
        total_frames,
        table_bytes,
        table_frame_count
    );

    let mut table_phys: Option<PhysAddr> = None;
    for entry in memory_map {
        if entry.entry_type == limine::memory_map::EntryType::USABLE
            && entry.length >= (table_frame_count as u64 * PAGE_SIZE)
            && entry.base > 0
        {
            table_phys = Some(PhysAddr::new(entry.base));
            break;
        }
    }
    let table_phys = table_phys.expect("buddy: no usable region large enough for frame table");
    kprintln!("[buddy] frame table placed at physical {}", table_phys);

    let base = table_phys.to_virt().as_mut_ptr::<Frame>();
    // SAFETY: `base` points at `table_frame_count` freshly-identified USABLE
    // pages, reachable through the HHDM, not yet referenced by anything else.
    unsafe {
        for i in 0..total_frames {
            ptr::write(base.add(i), Frame::reserved());
        }
    }

    *FRAME_TABLE.lock() = Some(FrameTableInfo { base, len: total_frames });

    let table_start_frame = (table_phys.as_u64() / PAGE_SIZE) as usize;

    let mut lists = FREE_LISTS.lock();
    let mut freed: u64 = 0;
    for entry in memory_map {
        if entry.entry_type != limine::memory_map::EntryType::USABLE {
            continue;
        }
        let mut start_frame = (entry.base / PAGE_SIZE) as usize;
        let end_frame = ((entry.base + entry.length) / PAGE_SIZE).min(total_frames as u64) as usize;

        while start_frame < end_frame {
            if start_frame == 0 {
                // Frame 0 stays reserved as a null-pointer guard.
                start_frame += 1;
                continue;
            }
            if start_frame >= table_start_frame && start_frame < table_start_frame + table_frame_count {
                start_frame = table_start_frame + table_frame_count;
                continue;
            }

            let region_end = if table_start_frame > start_frame && table_start_frame < end_frame {
                table_start_frame
            } else {
                end_frame
            };

            let mut order = MAX_ORDER;
            while order > 0 {
                let block = 1usize << order;
                if start_frame % block == 0 && start_frame + block <= region_end {
                    break;
                }
                order -= 1;
            }
            let block = 1usize << order;
            if start_frame + block > region_end {
                // Not even order 0 fits (region already exhausted); bail
                // this iteration of the outer loop.
                break;
            }

            push_free_block(&mut lists, base, start_frame as u32, order);
            freed += block as u64;
            start_frame += block;
        }
    }

    kprintln!(
        "[buddy] {} frames free ({} MiB)",
        freed,
        freed * PAGE_SIZE / 1024 / 1024
    );
}

fn push_free_block(lists: &mut FreeLists, base: *mut Frame, pfn: u32, order: usize) {
    let phys = pfn as u64 * PAGE_SIZE;
    let zone = ZoneKind::for_phys_addr(phys);
    let zone_idx = zone as usize;
    let node = 0usize;

    // SAFETY: `pfn` is within the table, and we hold `FREE_LISTS` so no
    // other order/list mutation races this write.
    unsafe {
        let frame = &mut *base.add(pfn as usize);
        frame.zone = zone;
        frame.node = node as u8;
        frame.order = order as i8;
        frame.free_next = lists.heads[node][zone_idx][order];
    }
    lists.heads[node][zone_idx][order] = pfn;
    lists.free_count[node][zone_idx][order] += 1;
}

fn remove_from_list(lists: &mut FreeLists, base: *mut Frame, node: usize, zone_idx: usize, order: usize, target: u32) {
    let head = lists.heads[node][zone_idx][order];
    if head == target {
        let next = unsafe { (*base.add(target as usize)).free_next };
        lists.heads[node][zone_idx][order] = next;
        lists.free_count[node][zone_idx][order] -= 1;
        return;
    }
    let mut cur = head;
    while cur != FRAME_LIST_NONE {
        let next = unsafe { (*base.add(cur as usize)).free_next };
        if next == target {
            let target_next = unsafe { (*base.add(target as usize)).free_next };
            unsafe {
                (*base.add(cur as usize)).free_next = target_next;
            }
            lists.free_count[node][zone_idx][order] -= 1;
            return;
        }
        cur = next;
    }
    debug_assert!(false, "buddy: coalesce buddy {} not found on its own free list", target);
}

fn pop_block(lists: &mut FreeLists, base: *mut Frame, node: usize, zone: ZoneKind, order: usize) -> Option<u32> {
    let zone_idx = zone as usize;
    let mut found_order = None;
    for o in order..=MAX_ORDER {
        if lists.heads[node][zone_idx][o] != FRAME_LIST_NONE {
            found_order = Some(o);
            break;
        }
    }
    let found_order = found_order?;

    let pfn = lists.heads[node][zone_idx][found_order];
    unsafe {
        let frame = &mut *base.add(pfn as usize);
        lists.heads[node][zone_idx][found_order] = frame.free_next;
        frame.free_next = FRAME_LIST_NONE;
        frame.order = -1;
    }
    lists.free_count[node][zone_idx][found_order] -= 1;

    // Split from the found block down to the requested order, pushing
    // each freed upper buddy back onto its own list.
    let mut cur_order = found_order;
    let mut cur_pfn = pfn;
    while cur_order > order {
        cur_order -= 1;
        let buddy_pfn = cur_pfn ^ (1u32 << cur_order);
        unsafe {
            let buddy = &mut *base.add(buddy_pfn as usize);
            buddy.order = cur_order as i8;
            buddy.zone = zone;
            buddy.node = node as u8;
            buddy.free_next = lists.heads[node][zone_idx][cur_order];
        }
        lists.heads[node][zone_idx][cur_order] = buddy_pfn;
        lists.free_count[node][zone_idx][cur_order] += 1;
    }

    unsafe {
        (*base.add(cur_pfn as usize)).inc_ref();
    }
    Some(cur_pfn)
}

const ZONE_FALLBACK_GENERAL: [ZoneKind; 3] = [ZoneKind::Normal, ZoneKind::Dma32, ZoneKind::Dma];

fn alloc_from_zones(order: usize, zones: &[ZoneKind]) -> Option<PhysAddr> {
    assert!(order <= MAX_ORDER, "buddy: order {} exceeds MAX_ORDER", order);
    let info = table_info();
    let mut lists = FREE_LISTS.lock();
    for node in 0..MAX_NODES {
        for &zone in zones {
            if let Some(pfn) = pop_block(&mut lists, info.base, node, zone, order) {
                return Some(PhysAddr::new(pfn as u64 * PAGE_SIZE));
            }
        }
    }
    None
}

/// Allocates `2^order` contiguous physical frames from whichever zone
/// has room, preferring `Normal` so DMA-capable memory stays available
/// for callers that actually need it.
pub fn alloc_pages(order: usize) -> Result<PhysAddr, AllocError> {
    alloc_from_zones(order, &ZONE_FALLBACK_GENERAL).ok_or(AllocError::OutOfMemory)
}

/// Allocates `2^order` contiguous frames restricted to the legacy
/// sub-16 MiB DMA zone.
pub fn alloc_pages_dma(order: usize) -> Result<PhysAddr, AllocError> {
    alloc_from_zones(order, &[ZoneKind::Dma]).ok_or(AllocError::OutOfMemory)
}

/// Allocates a single 4 KiB frame. Contents are uninitialized.
pub fn alloc_frame() -> Result<PhysAddr, AllocError> {
    alloc_pages(0)
}

/// Allocates a single 4 KiB frame, zeroed. Page tables must start this way.
pub fn alloc_frame_zeroed() -> Result<PhysAddr, AllocError> {
    let frame = alloc_frame()?;
    unsafe {
        ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    Ok(frame)
}

/// Frees `2^order` contiguous frames starting at `addr`, coalescing with
/// the buddy block at each level while the sibling is also free.
///
/// # Panics
/// - If `addr` is not page-aligned or out of range.
pub fn free_pages(addr: PhysAddr, order: usize) {
    assert!(addr.is_page_aligned(), "buddy: cannot free unaligned address {}", addr);
    assert!(order <= MAX_ORDER);

    let info = table_info();
    let pfn = (addr.as_u64() / PAGE_SIZE) as u32;
    assert!((pfn as usize) < info.len, "buddy: frame {} out of range", pfn);

    let remaining = unsafe { (*info.base.add(pfn as usize)).dec_ref() };
    if remaining != 0 {
        return;
    }

    let (zone, node) = unsafe {
        let frame = &*info.base.add(pfn as usize);
        (frame.zone(), frame.node() as usize)
    };

    let mut lists = FREE_LISTS.lock();
    let zone_idx = zone as usize;
    let mut cur_pfn = pfn;
    let mut cur_order = order;

    while cur_order < MAX_ORDER {
        let buddy_pfn = cur_pfn ^ (1u32 << cur_order);
        if buddy_pfn as usize >= info.len {
            break;
        }
        let buddy_is_free = unsafe {
            let buddy = &*info.base.add(buddy_pfn as usize);
            buddy.order == cur_order as i8 && buddy.zone() == zone
        };
        if !buddy_is_free {
            break;
        }
        remove_from_list(&mut lists, info.base, node, zone_idx, cur_order, buddy_pfn);
        cur_pfn = cur_pfn.min(buddy_pfn);
        cur_order += 1;
    }

    push_free_block(&mut lists, info.base, cur_pfn, cur_order);
}

/// Frees a single 4 KiB frame.
pub fn free_frame(addr: PhysAddr) {
    free_pages(addr, 0);
}

/// Returns the `Frame` descriptor for the frame backing `addr`.
///
/// # Panics
/// If `addr` is out of the tracked range.
pub fn frame_at(addr: PhysAddr) -> &'static Frame {
    let info = table_info();
    let pfn = (addr.as_u64() / PAGE_SIZE) as usize;
    assert!(pfn < info.len, "buddy: frame {} out of range", pfn);
    // SAFETY: the frame table is allocated once at init and never freed
    // or moved; the returned reference is valid for the program's life.
    unsafe { &*info.base.add(pfn) }
}

/// Returns a snapshot of current free-frame counts across all zones.
pub fn stats() -> BuddyStats {
    let info = table_info();
    let lists = FREE_LISTS.lock();
    let mut free: u64 = 0;
    for node in 0..MAX_NODES {
        for zone in 0..ZoneKind::COUNT {
            for order in 0..=MAX_ORDER {
                free += lists.free_count[node][zone][order] * (1u64 << order);
            }
        }
    }
    BuddyStats { total_frames: info.len, free_frames: free }
}
