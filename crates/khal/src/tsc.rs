//! TSC (Time Stamp Counter) based monotonic time.
//!
//! The scheduler's tick accounting (`update_curr`, vruntime deltas, DL
//! budget debits) all want a cheap, monotonic nanosecond clock. `rdtsc` is
//! the only source fast enough to call on every tick; we calibrate its
//! frequency once against the PIT during boot and convert cycles to
//! nanoseconds with a fixed-point multiply to avoid a division per read.

use core::sync::atomic::{AtomicU64, Ordering};

/// TSC cycles per millisecond, set once by `calibrate`. Zero means
/// uncalibrated — `now_ns()` falls back to returning raw cycles, which is
/// still monotonic, just not scaled to nanoseconds.
static CYCLES_PER_MS: AtomicU64 = AtomicU64::new(0);

/// Fixed-point scale factor (cycles → ns), Q32.32, set alongside
/// `CYCLES_PER_MS` so `now_ns()` avoids a 64-bit division on every call.
static NS_PER_CYCLE_Q32: AtomicU64 = AtomicU64::new(0);

#[inline]
fn rdtsc() -> u64 {
    let low: u32;
    let high: u32;
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack)
        );
    }
    ((high as u64) << 32) | low as u64
}

/// Record the TSC frequency, given a caller-measured `cycles_per_ms`
/// (e.g. from busy-waiting against the legacy PIT or HPET for 1ms).
///
/// Grounded in the teacher's cpu::read_tsc()'s documented claim of an
/// invariant TSC: once calibrated, the scale factor never changes.
pub fn calibrate(cycles_per_ms: u64) {
    CYCLES_PER_MS.store(cycles_per_ms, Ordering::Relaxed);
    // ns_per_cycle = 1_000_000 / cycles_per_ms, in Q32.32 fixed point.
    let q32 = ((1_000_000u128 << 32) / cycles_per_ms as u128) as u64;
    NS_PER_CYCLE_Q32.store(q32, Ordering::Relaxed);
}

/// Current monotonic time in nanoseconds since `calibrate` was called
/// (or since boot, in raw cycles, if never calibrated).
#[inline]
pub fn now_ns() -> u64 {
    let cycles = rdtsc();
    let scale = NS_PER_CYCLE_Q32.load(Ordering::Relaxed);
    if scale == 0 {
        return cycles;
    }
    ((cycles as u128 * scale as u128) >> 32) as u64
}

/// Raw TSC value, for callers doing their own delta math (e.g. the
/// calibration routine itself, or `update_curr`'s `exec_start` stamps).
#[inline]
pub fn read_raw() -> u64 {
    rdtsc()
}
