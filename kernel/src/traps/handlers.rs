//! Interrupt and exception handlers.

use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use crate::arch::x86_64::cpu;

/// IST slot used for the double-fault handler, so a double fault caused by
/// a stack overflow on the normal kernel stack still gets a valid stack to
/// run on. Matches the IST index `arch::smp::CoreLocal` reserves for it.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 0;

/// Breakpoint exception handler (INT 3).
///
/// This is a trap-type exception triggered by the `int3` instruction.
/// It's commonly used for debugging.
///
/// # Safety
///
/// This function must only be called by the CPU as an interrupt handler.
pub extern "x86-interrupt" fn breakpoint_handler(_stack_frame: InterruptStackFrame) {
    klog::info!("[020] Breakpoint exception triggered!");
}

/// Double-fault handler. Always fatal — by the time the CPU delivers a
/// double fault, the first exception handler has itself faulted, so
/// there's no safe way to resume; the only correct response is to stop
/// this core.
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    klog::error!("DOUBLE FAULT (error_code={:#x})\n{:#?}", error_code, stack_frame);
    cpu::halt_forever();
}

/// Page-fault handler.
///
/// Reads the faulting address from CR2 and decides whether it can be
/// resolved as copy-on-write (a write fault against a present, read-only,
/// COW-tagged mapping) by handing off to the page-table engine; any other
/// fault in kernel code is fatal, and a fault from user mode kills only the
/// faulting task once user-mode tasks exist.
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = cpu::read_cr2();
    let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let is_user = error_code.contains(PageFaultErrorCode::USER_MODE);

    if is_write {
        if crate::memory::pagetable::handle_cow_fault(crate::memory::address::VirtAddr::new(fault_addr)) {
            return;
        }
    }

    klog::error!(
        "PAGE FAULT at {:#x} (write={}, user={}, error={:?})\n{:#?}",
        fault_addr, is_write, is_user, error_code, stack_frame
    );
    cpu::halt_forever();
}

/// Local APIC timer handler. Fires at the fixed tick rate armed by
/// `khal::apic::init_timer`; drives the scheduler's per-tick accounting
/// (vruntime updates, RT/DL budget decrement, preemption checks) before
/// acknowledging the interrupt.
pub extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    crate::sched::core::scheduler_tick();
    khal::apic::eoi();
}

/// Reschedule IPI handler.
///
/// Sent by `task_wake_up` when the woken task was placed on a remote run
/// queue, and by the load balancer after migrating a task onto this core.
/// Carries no payload — it only forces this core out of whatever it's
/// doing and back into `schedule()`, which re-reads its run queue.
pub extern "x86-interrupt" fn reschedule_handler(_stack_frame: InterruptStackFrame) {
    khal::apic::eoi();
    crate::sched::core::set_need_resched();
}

/// Spurious interrupt handler.
///
/// The Local APIC can raise the spurious vector without a real interrupt
/// ever having fired (e.g. a race between masking and delivery). Per the
/// APIC spec, no EOI should be sent for a genuinely spurious interrupt.
pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
    klog::warn!("spurious interrupt");
}

/// TLB shootdown IPI handler.
///
/// A remote core asked to invalidate a mapping it may have cached. The
/// page-table engine deposits the range to invalidate before broadcasting
/// this vector; we just drain it and `invlpg` locally.
pub extern "x86-interrupt" fn tlb_shootdown_handler(_stack_frame: InterruptStackFrame) {
    crate::memory::pagetable::handle_shootdown_ipi();
    khal::apic::eoi();
}

/// Halt IPI handler, sent by the panic handler to every other core.
/// Kernel state is no longer trustworthy once one core has panicked, so
/// every other core stops rather than keep scheduling against it.
pub extern "x86-interrupt" fn halt_handler(_stack_frame: InterruptStackFrame) -> ! {
    cpu::halt_forever();
}
