//! Priority inheritance.
//!
//! When a high-priority task blocks on a lock held by a lower-priority
//! task, the holder's effective priority is boosted to the waiter's so it
//! can't be preempted by something in between (priority inversion). The
//! boost is transitive: if the holder is itself blocked waiting on a
//! third task's lock, that third task inherits too, and so on up the
//! chain.
//!
//! This terminates because `effective_prio` only ever improves (gets
//! numerically smaller) as it propagates — a chain of waiters can't cycle
//! back to a priority it already raised past.

use crate::sched::rq::rq;
use crate::sched::task::TaskRef;

/// Maximum chain depth to walk before giving up. A real chain this long
/// would mean a lock-ordering bug elsewhere; this bound exists so a cyclic
/// wait graph (which should never happen, but must never hang the kernel)
/// can't spin forever.
const MAX_CHAIN_DEPTH: usize = 32;

fn effective_prio_from(normal_prio: u8, waiters_top: Option<u8>) -> u8 {
    match waiters_top {
        Some(p) if p < normal_prio => p,
        _ => normal_prio,
    }
}

/// Recompute `owner`'s effective priority as `min(normal_prio, top of its
/// pi_waiters)`, and propagate the change to whatever `owner` is itself
/// blocked on, up to `MAX_CHAIN_DEPTH` links.
///
/// `holder_of` resolves "who holds the lock `task` is blocked on", so this
/// module stays independent of the specific mutex/futex implementation —
/// callers plug in their own lookup.
pub fn propagate_boost(owner: &TaskRef, holder_of: impl Fn(&TaskRef) -> Option<TaskRef>) {
    let mut current = owner.clone();
    for _ in 0..MAX_CHAIN_DEPTH {
        let waiters_top = current.pi.lock().waiters_top_prio;
        let normal = *current.normal_prio.lock();
        let new_prio = effective_prio_from(normal, waiters_top);
        let old_prio = current.effective_prio();
        if new_prio == old_prio {
            return;
        }
        current.set_effective_prio(new_prio);

        let cpu = *current.on_cpu.lock();
        if *current.on_rq.lock() {
            let rq_handle = rq(cpu);
            let mut guard = rq_handle.lock();
            crate::sched::core::class_ops(current.class()).prio_changed(&mut guard, &current, old_prio);
        }

        match holder_of(&current) {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Register `waiter` as blocked on a resource held by `owner`, updating
/// `owner.pi.waiters_top_prio` and propagating the boost up the chain.
pub fn add_waiter(owner: &TaskRef, waiter: &TaskRef, holder_of: impl Fn(&TaskRef) -> Option<TaskRef>) {
    let waiter_prio = waiter.effective_prio();
    let mut pi = owner.pi.lock();
    pi.waiters_top_prio = Some(match pi.waiters_top_prio {
        Some(existing) => existing.min(waiter_prio),
        None => waiter_prio,
    });
    drop(pi);
    propagate_boost(owner, holder_of);
}

/// `waiter` is no longer blocked on `owner` (it acquired the resource, or
/// gave up waiting). `remaining_waiter_prios` is the set of priorities
/// still queued on the same resource after removing `waiter`, so the new
/// top can be recomputed without this module needing to own the wait
/// queue itself.
pub fn remove_waiter(
    owner: &TaskRef,
    remaining_waiter_prios: impl Iterator<Item = u8>,
    holder_of: impl Fn(&TaskRef) -> Option<TaskRef>,
) {
    let new_top = remaining_waiter_prios.min();
    owner.pi.lock().waiters_top_prio = new_top;
    propagate_boost(owner, holder_of);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_waiters_keeps_normal_priority() {
        assert_eq!(effective_prio_from(120, None), 120);
    }

    #[test]
    fn higher_priority_waiter_boosts() {
        // lower numeric value = higher priority
        assert_eq!(effective_prio_from(120, Some(10)), 10);
    }

    #[test]
    fn lower_priority_waiter_does_not_lower_priority() {
        assert_eq!(effective_prio_from(50, Some(120)), 50);
    }
}
