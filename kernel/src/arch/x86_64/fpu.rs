// =============================================================================
// MinimalOS NextGen — FPU/SSE State Save and Restore
// =============================================================================
//
// Every task that might execute a floating-point or SSE instruction needs
// its FPU/XMM register file saved across a context switch, or the next
// task to touch those registers silently corrupts whatever the previous
// task was computing. `fxsave`/`fxrstor` save and restore that whole
// register file (x87, MMX, XMM0-15, MXCSR) to a single 512-byte, 16-byte
// aligned block.
//
// N3710 SPECIFIC NOTES: no AVX, so `xsave` isn't needed — `fxsave`/
// `fxrstor` cover every register this CPU has.
// =============================================================================

use core::arch::asm;

/// CR0 bit 2: Emulation. Set means "trap every x87/SSE instruction to
/// #NM" (software FPU emulation) — must be clear for native FPU use.
const CR0_EM: u64 = 1 << 2;
/// CR0 bit 1: Monitor co-processor. Must be set so `wait`/`fwait` check
/// CR0.TS.
const CR0_MP: u64 = 1 << 1;

/// CR4 bit 9: OSFXSR. Must be set or `fxsave`/`fxrstor` fault with #UD.
const CR4_OSFXSR: u64 = 1 << 9;
/// CR4 bit 10: OSXMMEXCPT. Lets unmasked SSE exceptions raise #XM instead
/// of #UD.
const CR4_OSXMMEXCPT: u64 = 1 << 10;

/// The saved FPU/MMX/XMM register file. `fxsave`/`fxrstor` require their
/// operand 16-byte aligned; `repr(align(16))` guarantees that regardless
/// of where this ends up on the heap.
#[repr(C, align(16))]
pub struct FpuState {
    data: [u8; 512],
}

impl FpuState {
    /// A freshly reset state: all-zero is a valid `fxsave` image (x87 tag
    /// word all-empty, MXCSR 0 — `fxrstor` treats zero MXCSR as the
    /// post-reset default too, same as the CPU's own power-on state).
    pub fn new() -> Self {
        Self { data: [0; 512] }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Enable native FPU/SSE use on the current core.
///
/// Must be called once per core, after that core's GDT/IDT are up and
/// before any task on it can run user code — `main.rs` calls it on the
/// BSP, `arch::smp::ap_entry` calls it on every AP.
pub fn init() {
    unsafe {
        let mut cr0: u64;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        cr0 &= !CR0_EM;
        cr0 |= CR0_MP;
        asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));

        let mut cr4: u64;
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        cr4 |= CR4_OSFXSR | CR4_OSXMMEXCPT;
        asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));

        // `fxrstor` a zeroed state to bring the register file to a known
        // state instead of leaving whatever garbage was there at boot.
        let reset = FpuState::new();
        restore(&reset);
    }
}

/// Save the current FPU/XMM register file into `state`.
///
/// # Safety
/// `init()` must have run on this core first, or this traps with #UD.
pub unsafe fn save(state: &mut FpuState) {
    unsafe {
        asm!("fxsave [{}]", in(reg) state.data.as_mut_ptr(), options(nostack));
    }
}

/// Load the FPU/XMM register file from `state`.
///
/// # Safety
/// `init()` must have run on this core first, and `state` must hold a
/// previously-saved (or freshly-zeroed) `fxsave` image.
pub unsafe fn restore(state: &FpuState) {
    unsafe {
        asm!("fxrstor [{}]", in(reg) state.data.as_ptr(), options(nostack, readonly));
    }
}
