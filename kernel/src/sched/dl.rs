//! The deadline scheduling class (EDF — earliest deadline first).
//!
//! A DL task is admitted with a `(runtime, deadline, period)` triple: it
//! promises to need at most `runtime` ns of CPU time every `period` ns,
//! and wants to finish each chunk of work within `deadline` ns of it
//! becoming runnable. Admission control (`can_admit`) refuses a task if
//! the sum of `runtime/period` across every CPU's DL tasks would exceed
//! 1 — the classic EDF schedulability bound — so an admitted task's
//! deadline is mathematically guaranteed as long as it behaves.
//!
//! Always picked ahead of RT and fair (see `sched::class`'s ordering),
//! since a missed deadline is the one failure mode this whole class
//! exists to prevent.

use alloc::sync::Arc;

use crate::sched::class::{DequeueFlags, EnqueueFlags, SchedClassOps};
use crate::sched::rq::Rq;
use crate::sched::task::{DlState, SchedClass, TaskRef};

/// Q32.32 fixed-point scale, same convention as `khal::tsc`, used so
/// admission control avoids floating point entirely.
const BW_SCALE_Q32: u128 = 1u128 << 32;

fn bandwidth_q32(runtime_ns: u64, period_ns: u64) -> u64 {
    if period_ns == 0 {
        return 0;
    }
    ((runtime_ns as u128 * BW_SCALE_Q32) / period_ns as u128) as u64
}

/// EDF admission test: would adding `candidate` push this CPU's total DL
/// bandwidth over 100%?
pub fn can_admit(rq: &Rq, candidate: &DlState) -> bool {
    let extra = bandwidth_q32(candidate.runtime_ns, candidate.period_ns);
    rq.dl.total_bandwidth_q32.saturating_add(extra) <= BW_SCALE_Q32 as u64
}

pub struct DlClass;

impl DlClass {
    fn key_of(task: &TaskRef) -> (u64, u64) {
        (task.dl.lock().absolute_deadline_ns, task.pid)
    }
}

impl SchedClassOps for DlClass {
    fn enqueue_task(&self, rq: &mut Rq, task: &TaskRef, flags: EnqueueFlags) {
        {
            let mut dl = task.dl.lock();
            if matches!(flags, EnqueueFlags::Fork) || dl.absolute_deadline_ns == 0 {
                let now = khal::tsc::now_ns();
                dl.absolute_deadline_ns = now + dl.deadline_ns;
                dl.remaining_runtime_ns = dl.runtime_ns;
                dl.throttled = false;
                let bw = bandwidth_q32(dl.runtime_ns, dl.period_ns);
                rq.dl.total_bandwidth_q32 += bw;
            }
        }
        let key = Self::key_of(task);
        rq.dl.tree.insert(key, Arc::clone(task));
        rq.dl.nr_running += 1;
        *task.on_rq.lock() = true;
    }

    fn dequeue_task(&self, rq: &mut Rq, task: &TaskRef, flags: DequeueFlags) {
        let key = Self::key_of(task);
        if rq.dl.tree.remove(&key).is_some() {
            rq.dl.nr_running = rq.dl.nr_running.saturating_sub(1);
        }
        if matches!(flags, DequeueFlags::Dead) {
            let dl = task.dl.lock();
            let bw = bandwidth_q32(dl.runtime_ns, dl.period_ns);
            rq.dl.total_bandwidth_q32 = rq.dl.total_bandwidth_q32.saturating_sub(bw);
        }
        *task.on_rq.lock() = false;
    }

    fn yield_task(&self, rq: &mut Rq) {
        // A DL task that yields still owns its slot until its deadline;
        // nothing to reorder — it just gives up the remainder of this
        // pick. It stays at the head of the tree, so immediately picking
        // again is correct unless another DL task now has an earlier
        // deadline (already reflected in the tree order).
        let _ = rq;
    }

    fn check_preempt_curr(&self, rq: &mut Rq, task: &TaskRef) {
        let Some(current) = rq.current.clone() else {
            rq.need_resched = true;
            return;
        };
        if current.class() != SchedClass::Deadline {
            rq.need_resched = true;
            return;
        }
        if task.dl.lock().absolute_deadline_ns < current.dl.lock().absolute_deadline_ns {
            rq.need_resched = true;
        }
    }

    fn pick_next_task(&self, rq: &mut Rq) -> Option<TaskRef> {
        rq.dl.tree.iter().next().map(|(_, t)| Arc::clone(t))
    }

    fn put_prev_task(&self, rq: &mut Rq, prev: &TaskRef) {
        if *prev.state.lock() == crate::sched::task::TaskState::Running
            && *prev.on_rq.lock()
            && !prev.dl.lock().throttled
        {
            let key = Self::key_of(prev);
            rq.dl.tree.insert(key, Arc::clone(prev));
        }
    }

    fn set_next_task(&self, _rq: &mut Rq, task: &TaskRef, _first: bool) {
        *task.exec_start_ns.lock() = khal::tsc::now_ns();
    }

    fn task_tick(&self, rq: &mut Rq, task: &TaskRef, _queued: bool) {
        self.update_curr(rq);
        let mut dl = task.dl.lock();
        if dl.remaining_runtime_ns == 0 {
            dl.throttled = true;
            drop(dl);
            rq.dl.tree.remove(&Self::key_of(task));
            rq.need_resched = true;
            return;
        }
        let now = khal::tsc::now_ns();
        if now >= dl.absolute_deadline_ns {
            // Period rolled over: replenish. A real implementation would
            // also log/count an overrun here if remaining_runtime_ns > 0.
            dl.absolute_deadline_ns = now + dl.deadline_ns;
            dl.remaining_runtime_ns = dl.runtime_ns;
            dl.throttled = false;
        }
    }

    fn task_fork(&self, rq: &mut Rq, task: &TaskRef) {
        self.enqueue_task(rq, task, EnqueueFlags::Fork);
        self.dequeue_task(rq, task, DequeueFlags::Migrate);
    }

    fn task_dead(&self, _task: &TaskRef) {}

    fn switched_from(&self, rq: &mut Rq, task: &TaskRef) {
        self.dequeue_task(rq, task, DequeueFlags::Dead);
    }

    fn switched_to(&self, rq: &mut Rq, task: &TaskRef) {
        self.enqueue_task(rq, task, EnqueueFlags::Fork);
    }

    fn prio_changed(&self, _rq: &mut Rq, _task: &TaskRef, _old_prio: u8) {}

    fn select_task_rq(&self, task: &TaskRef, prev_cpu: usize) -> usize {
        // Bandwidth-aware placement belongs to the load balancer at
        // admission time (sched::balance::select_idle_or_least_loaded
        // with a DL-aware cap check); wakeups stay put.
        *task.cpu_affinity.lock();
        prev_cpu
    }

    fn migrate_task_rq(&self, task: &TaskRef, new_cpu: usize) {
        *task.on_cpu.lock() = new_cpu;
    }

    fn update_curr(&self, rq: &mut Rq) {
        let Some(current) = rq.current.clone() else { return };
        if current.class() != SchedClass::Deadline {
            return;
        }
        let now = khal::tsc::now_ns();
        let mut start = current.exec_start_ns.lock();
        let delta = now.saturating_sub(*start);
        *start = now;
        drop(start);

        let mut dl = current.dl.lock();
        dl.remaining_runtime_ns = dl.remaining_runtime_ns.saturating_sub(delta);
        let _ = rq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_duty_cycle_is_half_scale() {
        assert_eq!(bandwidth_q32(50, 100), (BW_SCALE_Q32 / 2) as u64);
    }

    #[test]
    fn zero_period_has_zero_bandwidth() {
        assert_eq!(bandwidth_q32(10, 0), 0);
    }

    #[test]
    fn admits_under_full_bandwidth() {
        let rq = Rq::new(0);
        let candidate = DlState { runtime_ns: 10, period_ns: 100, ..Default::default() };
        assert!(can_admit(&rq, &candidate));
    }

    #[test]
    fn refuses_when_already_saturated() {
        let mut rq = Rq::new(0);
        rq.dl.total_bandwidth_q32 = BW_SCALE_Q32 as u64;
        let candidate = DlState { runtime_ns: 1, period_ns: 100, ..Default::default() };
        assert!(!can_admit(&rq, &candidate));
    }
}
