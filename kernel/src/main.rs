#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

mod arch;
mod memory;
mod sched;
mod sync;
mod task;
mod traps;
mod util;

use khal::port::{inb, outb};
use limine::BaseRevision;

use crate::arch::x86_64::boot;
use crate::memory::address::PhysAddr;

/// Base revision supported by this kernel.
#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Legacy PIT frequency, fixed by the 8253/8254 hardware.
const PIT_FREQUENCY_HZ: u64 = 1_193_182;

/// Busy-wait `ms` milliseconds against the legacy PIT in one-shot mode,
/// measuring the TSC delta across the wait. This is the one place in the
/// kernel that still talks to the PIT directly — everything else uses
/// `khal::tsc::now_ns` once this has run.
fn calibrate_tsc_against_pit(ms: u64) -> u64 {
    let divisor = ((PIT_FREQUENCY_HZ * ms) / 1000) as u16;
    unsafe {
        outb(0x43, 0b0011_0000); // channel 0, mode 0, lobyte/hibyte, binary
        outb(0x40, (divisor & 0xFF) as u8);
        outb(0x40, (divisor >> 8) as u8);
    }

    let start = khal::tsc::read_raw();
    loop {
        let count = unsafe {
            outb(0x43, 0b0000_0000); // latch channel 0's current count
            let lo = inb(0x40) as u16;
            let hi = inb(0x40) as u16;
            (hi << 8) | lo
        };
        // A one-shot counter counts down to 0 and stays there; a readback
        // greater than what we loaded means it already wrapped once,
        // which only happens if `ms` was too long for a 16-bit divisor.
        if count == 0 || count > divisor {
            break;
        }
    }
    let end = khal::tsc::read_raw();

    (end - start) / ms
}

/// Kernel entry point called by the Limine bootloader.
///
/// Boot sequence (spec.md §6): HHDM → buddy allocator → heap → kernel
/// address space → Local APIC/IDT on the BSP → I/O APIC → TSC calibration
/// → scheduler bring-up → wake the APs → drop into the scheduler.
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(BASE_REVISION.is_supported());

    arch::serial::SERIAL.lock().init();
    klog::info!("MinimalOS NextGen booting");

    let hhdm_offset = boot::get_hhdm_offset();
    unsafe { memory::address::init_hhdm(hhdm_offset) };

    let memory_map = boot::get_memory_map();
    memory::buddy::init(memory_map);
    memory::heap::init();

    let cr3 = arch::x86_64::cpu::read_cr3();
    memory::mm::init_kernel_space(PhysAddr::new(cr3 & 0x000F_FFFF_FFFF_F000));

    let bsp_apic_id = khal::apic::init(hhdm_offset);
    unsafe { arch::smp::init_bsp(bsp_apic_id) };

    // Fixed GDT layout installed by `init_bsp` on every core: entry 1
    // (offset 0x08) is always the kernel code segment (see arch::gdt).
    traps::init_idt(0x08);

    khal::ioapic::init(hhdm_offset);

    let cycles_per_ms = calibrate_tsc_against_pit(10);
    khal::tsc::calibrate(cycles_per_ms);
    klog::info!("TSC calibrated: {} cycles/ms", cycles_per_ms);

    khal::apic::init_timer();

    arch::x86_64::fpu::init();

    let num_cpus = boot::get_mp_response().map_or(1, |mp| mp.cpus().len());
    sched::core::init(num_cpus);

    if let Some(mp) = boot::get_mp_response() {
        if mp.cpus().len() > 1 {
            unsafe { arch::smp::wake_aps(mp) };
        }
    }

    arch::smp::signal_ap_go();

    core::arch::asm!("sti");
    klog::info!("boot complete, entering scheduler on {} CPU(s)", num_cpus);

    loop {
        sched::core::schedule();
        arch::x86_64::cpu::halt();
    }
}
