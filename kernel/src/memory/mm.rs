//! The address-space object.
//!
//! Generalizes the teacher's `memory::paging::create_user_page_table` (one
//! call, no bookkeeping around it) into a tracked object: a PML4 frame plus
//! the list of regions mapped into it, refcounted so a `fork`-style copy
//! and the original can both tear down independently.
//!
//! One `AddressSpace` per process; threads within a process share it via
//! `Arc`. The higher half (kernel code, HHDM, heap) is installed once at
//! boot by `init_kernel_space` and then copied, PML4-entry by PML4-entry,
//! into every address space created afterward — so every process sees the
//! same kernel mappings without re-walking them.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::buddy;
use crate::memory::frame::AllocError;
use crate::memory::pagetable::{self, MapError, PageFlags};
use crate::sync::spinlock::SpinLock;

/// First PML4 index belonging to the higher half (kernel space) on a
/// 4-level x86_64 page table; everything below this is user space.
const KERNEL_PML4_START: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    Stack,
    /// Backed by a file/image loaded at process creation; not reclaimable
    /// by paging it out since there's no backing store to write to yet.
    Image,
}

/// One contiguous mapped region of a process's address space.
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: u64,
    pub kind: VmaKind,
}

impl Vma {
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }
}

struct Inner {
    pml4_phys: PhysAddr,
    vmas: Vec<Vma>,
}

/// A process's virtual address space: its PML4 root plus the VMA list
/// describing what's mapped where. Shared by `Arc` across threads of the
/// same process; dropped (and its page tables torn down) when the last
/// thread referencing it exits.
pub struct AddressSpace {
    inner: SpinLock<Inner>,
}

static KERNEL_PML4_PHYS: SpinLock<Option<PhysAddr>> = SpinLock::new(None);

/// Record the boot-time kernel PML4 (read from CR3 once paging is live),
/// so every later `AddressSpace::new` has a higher half to copy from.
pub fn init_kernel_space(kernel_pml4_phys: PhysAddr) {
    *KERNEL_PML4_PHYS.lock() = Some(kernel_pml4_phys);
}

impl AddressSpace {
    /// Create a fresh address space with an empty user half and the
    /// current kernel half shared in.
    pub fn new() -> Result<Arc<Self>, AllocError> {
        let pml4_phys = buddy::alloc_frame_zeroed()?;
        if let Some(kernel_pml4) = *KERNEL_PML4_PHYS.lock() {
            copy_kernel_half(kernel_pml4, pml4_phys);
        }
        Ok(Arc::new(Self { inner: SpinLock::new(Inner { pml4_phys, vmas: Vec::new() }) }))
    }

    /// Duplicate an address space for `fork`: every present user-half page
    /// is remapped copy-on-write in both the parent and the child, so
    /// neither actually copies a byte until one of them writes.
    pub fn fork(&self) -> Result<Arc<Self>, AllocError> {
        let child = Self::new()?;
        let parent = self.inner.lock();

        for vma in parent.vmas.iter() {
            let mut addr = vma.start.page_align_down();
            while addr.as_u64() < vma.end.as_u64() {
                if let Some((phys, flags)) = unsafe { pagetable::translate(parent.pml4_phys, addr) } {
                    let cow_flags = make_cow(flags);
                    let _ = unsafe { pagetable::protect(parent.pml4_phys, addr, cow_flags) };
                    let _ = unsafe { pagetable::map(child.inner.lock().pml4_phys, addr, phys, cow_flags) };
                    buddy::frame_at(phys).inc_ref();
                }
                addr = VirtAddr::new(addr.as_u64() + crate::memory::address::PAGE_SIZE);
            }
        }
        child.inner.lock().vmas = parent.vmas.clone();
        Ok(child)
    }

    pub fn pml4_phys(&self) -> PhysAddr {
        self.inner.lock().pml4_phys
    }

    /// Install this address space on the current core.
    ///
    /// # Safety
    /// Must only be called as part of a context switch into a task that
    /// actually owns this address space.
    pub unsafe fn switch_to(&self) {
        let phys = self.pml4_phys();
        unsafe { crate::arch::x86_64::cpu::write_cr3(phys.as_u64()) };
    }

    /// Map a fresh anonymous region, backing every page with a zeroed
    /// frame from the buddy allocator immediately (no demand paging yet —
    /// see `memory::pagetable`'s Non-goals).
    pub fn map_anonymous(&self, start: VirtAddr, len: u64, flags: PageFlags, kind: VmaKind) -> Result<(), MapError> {
        let mut inner = self.inner.lock();
        let end = VirtAddr::new(start.as_u64() + len).page_align_up();
        let mut addr = start.page_align_down();
        while addr.as_u64() < end.as_u64() {
            let frame = buddy::alloc_frame_zeroed()?;
            unsafe { pagetable::map(inner.pml4_phys, addr, frame, flags)? };
            addr = VirtAddr::new(addr.as_u64() + crate::memory::address::PAGE_SIZE);
        }
        inner.vmas.push(Vma { start, end, flags: flags.bits(), kind });
        Ok(())
    }

    pub fn vma_for(&self, addr: VirtAddr) -> Option<Vma> {
        self.inner.lock().vmas.iter().find(|v| v.contains(addr)).cloned()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for vma in inner.vmas.iter() {
            let mut addr = vma.start.page_align_down();
            while addr.as_u64() < vma.end.as_u64() {
                if let Ok(phys) = unsafe { pagetable::unmap(inner.pml4_phys, addr) } {
                    let frame = buddy::frame_at(phys);
                    if frame.dec_ref() == 0 {
                        buddy::free_frame(phys);
                    }
                }
                addr = VirtAddr::new(addr.as_u64() + crate::memory::address::PAGE_SIZE);
            }
        }
        buddy::free_frame(inner.pml4_phys);
    }
}

fn make_cow(flags: PageFlags) -> PageFlags {
    flags.without(PageFlags::WRITABLE) | PageFlags::COW
}

fn copy_kernel_half(from: PhysAddr, to: PhysAddr) {
    let from_virt = from.to_virt().as_ptr::<u64>();
    let to_virt = to.to_virt().as_mut_ptr::<u64>();
    unsafe {
        for i in KERNEL_PML4_START..512 {
            let entry = core::ptr::read_volatile(from_virt.add(i));
            core::ptr::write_volatile(to_virt.add(i), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vma_contains_is_half_open() {
        let vma = Vma { start: VirtAddr::new(0x1000), end: VirtAddr::new(0x2000), flags: 0, kind: VmaKind::Anonymous };
        assert!(vma.contains(VirtAddr::new(0x1000)));
        assert!(vma.contains(VirtAddr::new(0x1fff)));
        assert!(!vma.contains(VirtAddr::new(0x2000)));
    }

    #[test]
    fn make_cow_strips_writable_and_sets_cow() {
        let flags = make_cow(PageFlags::USER_RW);
        assert!(!flags.contains(PageFlags::WRITABLE));
        assert!(flags.contains(PageFlags::COW));
        assert!(flags.contains(PageFlags::PRESENT));
    }
}
