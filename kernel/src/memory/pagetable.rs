//! The page-table engine.
//!
//! Supersedes `memory::paging`'s single-PML4, PMM-backed walker: frames for
//! intermediate tables now come from the buddy allocator, every walk takes
//! only the split lock of the table it's actually mutating (`Frame::
//! table_lock`, from `memory::frame`), and the engine understands 2 MiB
//! huge pages and copy-on-write in addition to plain 4 KiB mappings.
//!
//! Split locking: two threads mapping unrelated pages only ever contend if
//! their walks share an intermediate table (e.g. the same PD), never on an
//! unrelated subtree — the lock lives on the `Frame` backing each table,
//! not on the address space as a whole.

use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::x86_64::cpu;
use crate::memory::address::{PhysAddr, VirtAddr, HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory::buddy;
use crate::memory::frame::{self, AllocError};
use crate::sync::spinlock::SpinLock;

/// Bit-flag wrapper for page-table entry attributes, extended from
/// `memory::paging`'s with a software-defined copy-on-write bit (9..11 are
/// architecturally reserved for OS use on every x86_64 PTE level).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFlags(u64);

#[allow(dead_code)]
impl PageFlags {
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const WRITE_THROUGH: Self = Self(1 << 3);
    pub const CACHE_DISABLE: Self = Self(1 << 4);
    pub const HUGE: Self = Self(1 << 7);
    /// Software bit: this mapping is copy-on-write. Always installed
    /// read-only regardless of the requested `WRITABLE` flag; the fault
    /// handler does the actual copy-and-unlock.
    pub const COW: Self = Self(1 << 9);
    pub const NO_EXECUTE: Self = Self(1 << 63);

    pub const KERNEL_RW: Self = Self(Self::PRESENT.0 | Self::WRITABLE.0);
    pub const USER_RW: Self = Self(Self::PRESENT.0 | Self::WRITABLE.0 | Self::USER.0);

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A present mapping already occupies this address.
    AlreadyMapped,
    /// No frame available for the leaf or an intermediate table.
    OutOfMemory,
    /// A huge mapping was requested where a 4 KiB table already exists at
    /// that level, or vice versa — splitting/merging must be explicit.
    HugePageConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    NotMapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectError {
    NotMapped,
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        MapError::OutOfMemory
    }
}

fn hhdm_table(phys: u64) -> *mut u64 {
    PhysAddr::new(phys).to_virt().as_mut_ptr::<u64>()
}

/// Table-walk descriptor: which `Frame` backs the table physically at
/// `phys`, so its split lock can be taken before any entry in it is read
/// or written.
fn lock_table(phys: u64) -> (crate::sync::spinlock::SpinLockGuard<'static, ()>, *mut u64) {
    let frame = buddy::frame_at(PhysAddr::new(phys));
    (frame.table_lock(), hhdm_table(phys))
}

/// Find or create the next-level table at `table[index]`, returning its
/// physical address. Allocates a zeroed frame from the buddy allocator on
/// a miss.
fn ensure_table(table_phys: u64, index: usize, flags: PageFlags) -> Result<u64, MapError> {
    let (_guard, table_virt) = lock_table(table_phys);
    // SAFETY: `_guard` holds this table's split lock for the read-modify-write below.
    let entry = unsafe { ptr::read_volatile(table_virt.add(index)) };

    if entry & PageFlags::PRESENT.bits() != 0 {
        if entry & PageFlags::HUGE.bits() != 0 {
            return Err(MapError::HugePageConflict);
        }
        if flags.contains(PageFlags::USER) && entry & PageFlags::USER.bits() == 0 {
            unsafe { ptr::write_volatile(table_virt.add(index), entry | PageFlags::USER.bits()) };
        }
        return Ok(entry & PHYS_ADDR_MASK);
    }

    let new_frame = buddy::alloc_frame_zeroed()?;
    let mut flag_bits = PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits();
    if flags.contains(PageFlags::USER) {
        flag_bits |= PageFlags::USER.bits();
    }
    unsafe {
        ptr::write_volatile(table_virt.add(index), new_frame.as_u64() | flag_bits);
    }
    Ok(new_frame.as_u64())
}

fn indices(virt: VirtAddr) -> [usize; 4] {
    let idx = virt.page_table_indices();
    [idx[3] as usize, idx[2] as usize, idx[1] as usize, idx[0] as usize]
}

/// Map a 4 KiB page in the address space rooted at `pml4_phys`.
///
/// # Safety
/// `pml4_phys` must be a live PML4 frame; `virt`/`phys` must be
/// page-aligned; the caller is responsible for not racing this call
/// against an unmap/protect of the same address on another core without
/// its own synchronization above this layer (`memory::mm` serializes per
/// address space).
pub unsafe fn map(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), MapError> {
    debug_assert!(virt.is_page_aligned());
    debug_assert!(phys.is_page_aligned());

    let [pml4_idx, pdpt_idx, pd_idx, pt_idx] = indices(virt);
    let pdpt = ensure_table(pml4_phys.as_u64(), pml4_idx, flags)?;
    let pd = ensure_table(pdpt, pdpt_idx, flags)?;
    let pt = ensure_table(pd, pd_idx, flags)?;

    let (_guard, pt_virt) = lock_table(pt);
    let existing = unsafe { ptr::read_volatile(pt_virt.add(pt_idx)) };
    if existing & PageFlags::PRESENT.bits() != 0 {
        return Err(MapError::AlreadyMapped);
    }

    let entry = phys.as_u64() | flags.bits() | PageFlags::PRESENT.bits();
    unsafe { ptr::write_volatile(pt_virt.add(pt_idx), entry) };
    Ok(())
}

/// Map a 2 MiB huge page directly at the PD level.
///
/// # Safety
/// Same requirements as `map`, plus `virt`/`phys` must be 2 MiB aligned.
pub unsafe fn map_huge(
    pml4_phys: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), MapError> {
    debug_assert!(virt.as_u64() % HUGE_PAGE_SIZE == 0);
    debug_assert!(phys.as_u64() % HUGE_PAGE_SIZE == 0);

    let [pml4_idx, pdpt_idx, pd_idx, _] = indices(virt);
    let pdpt = ensure_table(pml4_phys.as_u64(), pml4_idx, flags)?;
    let pd = ensure_table(pdpt, pdpt_idx, flags)?;

    let (_guard, pd_virt) = lock_table(pd);
    let existing = unsafe { ptr::read_volatile(pd_virt.add(pd_idx)) };
    if existing & PageFlags::PRESENT.bits() != 0 {
        return Err(MapError::AlreadyMapped);
    }

    let entry = phys.as_u64() | flags.bits() | PageFlags::PRESENT.bits() | PageFlags::HUGE.bits();
    unsafe { ptr::write_volatile(pd_virt.add(pd_idx), entry) };
    Ok(())
}

/// Unmap a 4 KiB page, returning the physical frame it pointed at so the
/// caller can decide whether to free it (it might be a shared COW frame
/// with other mappings still live). Shoots the TLB down on every other
/// core before returning, so no stale translation survives the call.
///
/// # Safety
/// Same aliasing requirements as `map`.
pub unsafe fn unmap(pml4_phys: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    debug_assert!(virt.is_page_aligned());
    let [pml4_idx, pdpt_idx, pd_idx, pt_idx] = indices(virt);

    let pml4_virt = hhdm_table(pml4_phys.as_u64());
    let pml4e = unsafe { ptr::read_volatile(pml4_virt.add(pml4_idx)) };
    if pml4e & PageFlags::PRESENT.bits() == 0 {
        return Err(UnmapError::NotMapped);
    }
    let pdpt_virt = hhdm_table(pml4e & PHYS_ADDR_MASK);
    let pdpte = unsafe { ptr::read_volatile(pdpt_virt.add(pdpt_idx)) };
    if pdpte & PageFlags::PRESENT.bits() == 0 {
        return Err(UnmapError::NotMapped);
    }
    let pd_phys = pdpte & PHYS_ADDR_MASK;
    let (pd_guard, pd_virt) = lock_table(pd_phys);
    let pde = unsafe { ptr::read_volatile(pd_virt.add(pd_idx)) };
    if pde & PageFlags::PRESENT.bits() == 0 {
        return Err(UnmapError::NotMapped);
    }
    if pde & PageFlags::HUGE.bits() != 0 {
        unsafe { ptr::write_volatile(pd_virt.add(pd_idx), 0) };
        drop(pd_guard);
        broadcast_shootdown(virt);
        return Ok(PhysAddr::new(pde & 0x000F_FFFF_FFE0_0000));
    }
    let pt_phys = pde & PHYS_ADDR_MASK;
    drop(pd_guard);

    let (_pt_guard, pt_virt) = lock_table(pt_phys);
    let pte = unsafe { ptr::read_volatile(pt_virt.add(pt_idx)) };
    if pte & PageFlags::PRESENT.bits() == 0 {
        return Err(UnmapError::NotMapped);
    }
    unsafe { ptr::write_volatile(pt_virt.add(pt_idx), 0) };
    drop(_pt_guard);
    broadcast_shootdown(virt);
    Ok(PhysAddr::new(pte & PHYS_ADDR_MASK))
}

/// Change the permission bits of an existing 4 KiB mapping in place.
pub unsafe fn protect(pml4_phys: PhysAddr, virt: VirtAddr, flags: PageFlags) -> Result<(), ProtectError> {
    debug_assert!(virt.is_page_aligned());
    let [pml4_idx, pdpt_idx, pd_idx, pt_idx] = indices(virt);

    let pml4_virt = hhdm_table(pml4_phys.as_u64());
    let pml4e = unsafe { ptr::read_volatile(pml4_virt.add(pml4_idx)) };
    if pml4e & PageFlags::PRESENT.bits() == 0 {
        return Err(ProtectError::NotMapped);
    }
    let pdpt_virt = hhdm_table(pml4e & PHYS_ADDR_MASK);
    let pdpte = unsafe { ptr::read_volatile(pdpt_virt.add(pdpt_idx)) };
    if pdpte & PageFlags::PRESENT.bits() == 0 {
        return Err(ProtectError::NotMapped);
    }
    let (pd_guard, pd_virt) = lock_table(pdpte & PHYS_ADDR_MASK);
    let pde = unsafe { ptr::read_volatile(pd_virt.add(pd_idx)) };
    if pde & PageFlags::PRESENT.bits() == 0 {
        return Err(ProtectError::NotMapped);
    }
    let pt_phys = pde & PHYS_ADDR_MASK;
    drop(pd_guard);

    let (_pt_guard, pt_virt) = lock_table(pt_phys);
    let pte = unsafe { ptr::read_volatile(pt_virt.add(pt_idx)) };
    if pte & PageFlags::PRESENT.bits() == 0 {
        return Err(ProtectError::NotMapped);
    }
    let phys = pte & PHYS_ADDR_MASK;
    let new_entry = phys | flags.bits() | PageFlags::PRESENT.bits();
    unsafe { ptr::write_volatile(pt_virt.add(pt_idx), new_entry) };
    drop(_pt_guard);
    broadcast_shootdown(virt);
    Ok(())
}

/// Walk `pml4_phys` for `virt`, returning the physical address and raw
/// entry flags of whatever maps it (4 KiB or 2 MiB).
pub unsafe fn translate(pml4_phys: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let [pml4_idx, pdpt_idx, pd_idx, pt_idx] = indices(virt);

    let pml4_virt = hhdm_table(pml4_phys.as_u64());
    let pml4e = unsafe { ptr::read_volatile(pml4_virt.add(pml4_idx)) };
    if pml4e & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pdpt_virt = hhdm_table(pml4e & PHYS_ADDR_MASK);
    let pdpte = unsafe { ptr::read_volatile(pdpt_virt.add(pdpt_idx)) };
    if pdpte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pd_virt = hhdm_table(pdpte & PHYS_ADDR_MASK);
    let pde = unsafe { ptr::read_volatile(pd_virt.add(pd_idx)) };
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pde & PageFlags::HUGE.bits() != 0 {
        let base = pde & 0x000F_FFFF_FFE0_0000;
        return Some((PhysAddr::new(base | (virt.as_u64() & 0x1F_FFFF)), PageFlags(pde)));
    }
    let pt_virt = hhdm_table(pde & PHYS_ADDR_MASK);
    let pte = unsafe { ptr::read_volatile(pt_virt.add(pt_idx)) };
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((PhysAddr::new(pte & PHYS_ADDR_MASK), PageFlags(pte)))
}

/// Handle a write fault against a present, read-only mapping: if it's
/// tagged `COW`, resolve it by either dropping the bit in place (last
/// reference to the frame — no copy needed) or copying the frame and
/// remapping it writable for just this address space. Returns `false` if
/// the fault isn't a COW fault at all (caller treats it as a real error).
pub fn handle_cow_fault(virt: VirtAddr) -> bool {
    let pml4_phys = PhysAddr::new(cpu::read_cr3() & PHYS_ADDR_MASK);
    let page = virt.page_align_down();

    let Some((phys, entry_flags)) = (unsafe { translate(pml4_phys, page) }) else {
        return false;
    };
    if !entry_flags.contains(PageFlags::COW) || entry_flags.contains(PageFlags::WRITABLE) {
        return false;
    }

    let frame = buddy::frame_at(phys);
    let new_flags = entry_flags.without(PageFlags::COW) | PageFlags::WRITABLE;

    if frame.refcount() == 1 {
        // Sole owner: no copy needed, just drop the write protection.
        let _ = unsafe { protect(pml4_phys, page, new_flags) };
        return true;
    }

    let Ok(new_frame) = buddy::alloc_frame() else {
        return false;
    };
    unsafe {
        ptr::copy_nonoverlapping(
            phys.to_virt().as_ptr::<u8>(),
            new_frame.to_virt().as_mut_ptr::<u8>(),
            PAGE_SIZE as usize,
        );
    }
    if unsafe { unmap(pml4_phys, page) }.is_err() {
        buddy::free_frame(new_frame);
        return false;
    }
    if unsafe { map(pml4_phys, page, new_frame, new_flags) }.is_err() {
        buddy::free_frame(new_frame);
        return false;
    }
    buddy::free_frame(phys);
    true
}

// ── TLB shootdown ──────────────────────────────────────────────────────

/// Address currently being invalidated by every core's shootdown handler.
/// Protected end-to-end by `SHOOTDOWN_LOCK`: only one shootdown is ever
/// in flight at a time, so a single slot (not a queue) is enough.
static SHOOTDOWN_ADDR: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_ACKS: AtomicU32 = AtomicU32::new(0);
static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());

/// Invalidate `virt` on every core, including this one. Blocks until
/// every other core has acknowledged via `handle_shootdown_ipi`, so a
/// caller that's about to free the backing frame (`unmap`'s caller) never
/// races a remote core still translating through the stale entry.
pub fn broadcast_shootdown(virt: VirtAddr) {
    let num_cpus = crate::sched::rq::num_cpus();
    cpu::invlpg(virt.as_u64());
    if num_cpus <= 1 {
        return;
    }

    let guard = SHOOTDOWN_LOCK.lock();
    let targets = (num_cpus - 1) as u32;
    SHOOTDOWN_ADDR.store(virt.as_u64(), Ordering::Release);
    SHOOTDOWN_ACKS.store(0, Ordering::Release);
    crate::sched::core::broadcast_ipi_all_but_self(crate::traps::TLB_SHOOTDOWN_VECTOR);
    while SHOOTDOWN_ACKS.load(Ordering::Acquire) < targets {
        core::hint::spin_loop();
    }
    drop(guard);
}

/// Called from `traps::handlers::tlb_shootdown_handler` on every core but
/// the initiator.
pub fn handle_shootdown_ipi() {
    let addr = SHOOTDOWN_ADDR.load(Ordering::Acquire);
    cpu::invlpg(addr);
    SHOOTDOWN_ACKS.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_flag_survives_bitor_and_strip() {
        let flags = PageFlags::PRESENT | PageFlags::COW;
        assert!(flags.contains(PageFlags::COW));
        let stripped = flags.without(PageFlags::COW);
        assert!(!stripped.contains(PageFlags::COW));
        assert!(stripped.contains(PageFlags::PRESENT));
    }

    #[test]
    fn user_rw_implies_present_and_writable() {
        assert!(PageFlags::USER_RW.contains(PageFlags::PRESENT));
        assert!(PageFlags::USER_RW.contains(PageFlags::WRITABLE));
        assert!(PageFlags::USER_RW.contains(PageFlags::USER));
    }
}
