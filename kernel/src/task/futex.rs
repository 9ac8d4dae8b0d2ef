//! [073] Futex — fast user-space mutex support.
//!
//! Provides two operations:
//!   - `FUTEX_WAIT(addr, expected)` — if `*addr == expected`, block the
//!	 calling task until another task calls `FUTEX_WAKE` on `addr`.
//!   - `FUTEX_WAKE(addr, count)` — wake up to `count` tasks blocked
//!	 on `addr`.
//!
//! Rebuilt over `sched::core::{block_current, task_wake_up}` instead of
//! the teacher's single-queue `ProcessState::Blocked` scan: the waiter
//! list here is its own registry, keyed by address, so waking doesn't
//! need to walk every run queue on every CPU looking for a match.

use alloc::vec::Vec;

use crate::sched::task::TaskRef;
use crate::sync::spinlock::SpinLock;

/// Futex operation: wait if `*addr == expected`.
pub const FUTEX_WAIT: u64 = 0;
/// Futex operation: wake up to `count` waiters on `addr`.
pub const FUTEX_WAKE: u64 = 1;

static WAITERS: SpinLock<Vec<(u64, TaskRef)>> = SpinLock::new(Vec::new());

/// Perform a futex WAIT.
///
/// Reads the u64 at `addr`; if it equals `expected`, registers the
/// current task as a waiter on `addr` and blocks it.
///
/// Returns 0 if the task was woken, or `u64::MAX` if `*addr != expected`
/// (spurious / contention resolved without sleeping).
///
/// # Safety
/// `addr` must be a valid, aligned pointer to a u64 in user memory.
pub unsafe fn futex_wait(addr: u64, expected: u64) -> u64 {
	let ptr = addr as *const u64;
	let current_val = unsafe { core::ptr::read_volatile(ptr) };

	if current_val != expected {
		return u64::MAX;
	}

	let this_cpu = crate::arch::smp::core_id() as usize;
	let Some(current) = crate::sched::rq::rq(this_cpu).lock().current.clone() else {
		return u64::MAX;
	};
	WAITERS.lock().push((addr, current));

	// Blocks and switches away; returns once something has woken us via
	// `sched::core::task_wake_up` (called from `futex_wake` below).
	crate::sched::core::block_current();

	0
}

/// Perform a futex WAKE.
///
/// Removes up to `count` waiters registered on `addr` and wakes them.
/// Returns the number of tasks actually woken.
pub fn futex_wake(addr: u64, count: u64) -> u64 {
	let mut woken: u64 = 0;
	let mut to_wake = Vec::new();

	{
		let mut waiters = WAITERS.lock();
		let mut i = 0;
		while i < waiters.len() && woken < count {
			if waiters[i].0 == addr {
				let (_, task) = waiters.remove(i);
				to_wake.push(task);
				woken += 1;
			} else {
				i += 1;
			}
		}
	}

	for task in &to_wake {
		crate::sched::core::task_wake_up(task);
	}

	woken
}
