//! Interrupt and trap handling.

mod handlers;
mod idt;

pub use idt::{init_idt, load_idt_on_ap, HALT_VECTOR, RESCHEDULE_VECTOR, TLB_SHOOTDOWN_VECTOR};

/// Trigger a breakpoint exception for testing.
#[inline]
pub fn trigger_breakpoint() {
    unsafe {
        core::arch::asm!("int3");
    }
}
