// =============================================================================
// MinimalOS NextGen — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages all physical and virtual memory in the kernel.
// It's organized into layers:
//
//   address.rs    — PhysAddr/VirtAddr newtypes (type safety for addresses)
//   frame.rs      — per-frame descriptors (refcount, split lock, zone/node)
//   buddy.rs      — NUMA-aware buddy physical frame allocator
//   pagetable.rs  — page-table engine (mapping, huge pages, COW, TLB shootdown)
//   mm.rs         — address-space object (PML4 + VMA list, fork/copy)
//   heap.rs       — kernel heap allocator (Box, Vec, etc.)
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod address;
pub mod buddy;
pub mod frame;
pub mod heap;
pub mod mm;
pub mod pagetable;

