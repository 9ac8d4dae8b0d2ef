//! Hardware Abstraction Layer.
#![no_std]

pub mod apic;
pub mod cpuid;
pub mod ioapic;
pub mod pic;
pub mod port;
pub mod serial;
pub mod tsc;

pub use serial::Serial;
