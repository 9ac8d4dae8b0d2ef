//! Scheduler-wide tunables that don't belong to any one class.
//!
//! Per-class constants (CFS latency/granularity, RT timeslice, DL
//! bandwidth scale) live next to the code that uses them in
//! `sched::fair`/`sched::rt`/`sched::dl` — this module is only for
//! knobs the core dispatcher and boot sequence need before any class
//! exists yet.

/// Scheduler tick rate. Drives the APIC timer's initial count
/// (`main.rs` calibrates `khal::apic::init_timer`'s divider/count against
/// this target once the TSC is calibrated) and therefore how often
/// `sched::core::scheduler_tick` runs per CPU.
pub const TICK_HZ: u64 = 250;
pub const TICK_PERIOD_NS: u64 = 1_000_000_000 / TICK_HZ;

/// Maximum tasks a single `idle_balance`/`periodic_balance` pass pulls in
/// one go, independent of the per-call cap in `sched::balance` — a safety
/// ceiling so a pathological imbalance can't turn one tick into an
/// unbounded migration storm.
pub const MAX_BALANCE_MIGRATIONS_PER_TICK: u32 = 32;
