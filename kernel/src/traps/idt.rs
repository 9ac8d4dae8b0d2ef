//! IDT initialization and management.
//!
//! The GDT/TSS are owned per-core by `arch::smp::CoreLocal` (each core
//! needs its own TSS to avoid the Busy-bit #GP); this module only builds
//! and loads the one IDT shared by every core.

use crate::arch::idt::{EntryOptions, GateType, Idt};
use spin::Once;

use super::handlers;

/// Global IDT instance, shared by every core.
static IDT: Once<Idt> = Once::new();

/// Vector used for the scheduler's reschedule IPI (`task_wake_up`'s
/// remote-CPU path and TLB shootdown both target this vector).
pub const RESCHEDULE_VECTOR: u8 = 0xFC;

/// Vector used for the page-table engine's TLB-shootdown IPI: a remote
/// core receiving this invalidates the address range described in
/// `memory::pagetable`'s pending-shootdown slot before acking.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xFD;

/// Vector broadcast by the panic handler so every other core halts
/// instead of continuing to run against now-undefined kernel state.
pub const HALT_VECTOR: u8 = 0xFE;

/// Build the shared IDT and load it on the BSP.
///
/// Must run after `arch::smp::init_bsp` so `selectors.kernel_code` is
/// already loaded into `CS` (the IDT's code-segment field must match).
pub fn init_idt(kernel_cs: u16) {
    let mut idt = Idt::new();

    let present_interrupt = EntryOptions::new()
        .set_present(true)
        .set_gate_type(GateType::Interrupt);

    let bp_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) =
        handlers::breakpoint_handler;
    idt.set_handler(3, bp_handler as usize, kernel_cs, present_interrupt);

    let double_fault_options = present_interrupt.set_stack_index(handlers::DOUBLE_FAULT_IST_INDEX);
    let df_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame, u64) -> !
        = handlers::double_fault_handler;
    idt.set_handler(8, df_handler as usize, kernel_cs, double_fault_options);

    let pf_handler: extern "x86-interrupt" fn(
        x86_64::structures::idt::InterruptStackFrame,
        x86_64::structures::idt::PageFaultErrorCode,
    ) = handlers::page_fault_handler;
    idt.set_handler(14, pf_handler as usize, kernel_cs, present_interrupt);

    let timer_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) =
        handlers::timer_handler;
    idt.set_handler(khal::apic::TIMER_VECTOR, timer_handler as usize, kernel_cs, present_interrupt);

    let resched_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) =
        handlers::reschedule_handler;
    idt.set_handler(RESCHEDULE_VECTOR, resched_handler as usize, kernel_cs, present_interrupt);

    let shootdown_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) =
        handlers::tlb_shootdown_handler;
    idt.set_handler(TLB_SHOOTDOWN_VECTOR, shootdown_handler as usize, kernel_cs, present_interrupt);

    let halt_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) -> ! =
        handlers::halt_handler;
    idt.set_handler(HALT_VECTOR, halt_handler as usize, kernel_cs, present_interrupt);

    let spur_handler: extern "x86-interrupt" fn(x86_64::structures::idt::InterruptStackFrame) =
        handlers::spurious_handler;
    idt.set_handler(0xFF, spur_handler as usize, kernel_cs, present_interrupt);

    let idt_ref = IDT.call_once(|| idt);
    idt_ref.load();

    klog::info!(
        "IDT loaded: breakpoint, double-fault(IST1), page-fault, timer({}), reschedule({:#x}), shootdown({:#x}), halt({:#x}), spurious",
        khal::apic::TIMER_VECTOR, RESCHEDULE_VECTOR, TLB_SHOOTDOWN_VECTOR, HALT_VECTOR
    );
}

/// Load the already-built shared IDT on an AP.
///
/// The IDT's entries reference absolute handler addresses and the shared
/// kernel code selector, both identical across cores, so APs just `lidt`
/// the same table the BSP built.
///
/// # Safety
/// Must only be called after `init_idt` has run on the BSP.
pub unsafe fn load_idt_on_ap() {
    IDT.get()
        .expect("load_idt_on_ap: shared IDT not yet built by BSP")
        .load();
}

/// Get a reference to the global IDT.
#[allow(dead_code)]
pub fn get_idt() -> Option<&'static Idt> {
    IDT.get()
}
