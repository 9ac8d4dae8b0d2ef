//! The fair (CFS-like) scheduling class.
//!
//! Every runnable fair task accumulates virtual runtime — wall-clock
//! runtime scaled by `NICE_0_WEIGHT / task.weight`, so a low-priority
//! (high nice) task's vruntime grows faster and it falls behind in the
//! ordering. `pick_next_task` always takes the lowest-vruntime task; over
//! time every task converges to the same vruntime, which is what gives
//! each a share of the CPU proportional to its weight.
//!
//! Grounded mechanically in the teacher's round-robin `Scheduler` (push
//! to a queue, pop the front, re-push on preemption) — the tree here
//! plays the same queue/re-queue role, just ordered by vruntime instead
//! of arrival.

use alloc::sync::Arc;

use crate::sched::class::{DequeueFlags, EnqueueFlags, SchedClassOps};
use crate::sched::rq::Rq;
use crate::sched::task::{SchedClass, TaskRef};

/// Weight for nice 0, matching the conventional CFS scale so the 40-entry
/// table below produces familiar ratios (nice 0 -> nice 1 is a ~10% cut).
pub const NICE_0_WEIGHT: u32 = 1024;

/// Targeted scheduling latency: every runnable task should get a turn at
/// least once per this window, if there are few enough of them that each
/// slice doesn't fall below `MIN_GRANULARITY_NS`.
pub const SCHED_LATENCY_NS: u64 = 24_000_000;
pub const MIN_GRANULARITY_NS: u64 = 3_000_000;

/// nice -20..=19 -> weight, the standard CFS table (each step ~1.25x).
const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291,
    29154, 23254, 18705, 14949, 11916,
    9548, 7620, 6100, 4904, 3906,
    3121, 2501, 1991, 1586, 1277,
    1024, 820, 655, 526, 423,
    335, 272, 215, 172, 137,
    110, 87, 70, 56, 45,
    36, 29, 23, 18, 15,
];

pub fn nice_to_weight(nice: i8) -> u32 {
    let idx = (nice as i32 + 20).clamp(0, 39) as usize;
    NICE_TO_WEIGHT[idx]
}

/// Convert wall-clock execution time into this task's vruntime delta:
/// `delta * NICE_0_WEIGHT / weight`. A heavier task (low nice) advances
/// its vruntime more slowly, so it stays runnable-first for longer.
fn calc_delta_vruntime(delta_exec_ns: u64, weight: u32) -> u64 {
    ((delta_exec_ns as u128 * NICE_0_WEIGHT as u128) / weight as u128) as u64
}

pub struct FairClass;

impl FairClass {
    fn key_of(task: &TaskRef) -> (u64, u64) {
        (task.fair.lock().vruntime, task.pid)
    }

    /// A newly woken or forked task doesn't start at vruntime 0 (it would
    /// then monopolize the CPU to "catch up" to everyone else) — it joins
    /// at `min_vruntime`, same as every mainline CFS implementation.
    fn place_entity(&self, rq: &mut Rq, task: &TaskRef, initial: bool) {
        let mut fair = task.fair.lock();
        if fair.weight == 0 {
            fair.weight = NICE_0_WEIGHT;
        }
        if initial || fair.vruntime < rq.fair.min_vruntime {
            fair.vruntime = rq.fair.min_vruntime;
        }
    }
}

impl SchedClassOps for FairClass {
    fn enqueue_task(&self, rq: &mut Rq, task: &TaskRef, flags: EnqueueFlags) {
        let initial = matches!(flags, EnqueueFlags::Fork);
        self.place_entity(rq, task, initial);
        let key = Self::key_of(task);
        rq.fair.load_weight += task.fair.lock().weight as u64;
        rq.fair.nr_running += 1;
        rq.fair.tree.insert(key, Arc::clone(task));
        *task.on_rq.lock() = true;
    }

    fn dequeue_task(&self, rq: &mut Rq, task: &TaskRef, _flags: DequeueFlags) {
        let key = Self::key_of(task);
        if rq.fair.tree.remove(&key).is_some() {
            rq.fair.load_weight = rq.fair.load_weight.saturating_sub(task.fair.lock().weight as u64);
            rq.fair.nr_running = rq.fair.nr_running.saturating_sub(1);
        }
        *task.on_rq.lock() = false;
    }

    fn yield_task(&self, rq: &mut Rq) {
        if let Some(current) = rq.current.clone() {
            // Push vruntime forward slightly so pick_next_task doesn't
            // just hand the CPU straight back.
            let mut fair = current.fair.lock();
            fair.vruntime += MIN_GRANULARITY_NS;
            drop(fair);
            self.dequeue_task(rq, &current, DequeueFlags::Sleep);
            self.enqueue_task(rq, &current, EnqueueFlags::Wakeup);
        }
    }

    fn check_preempt_curr(&self, rq: &mut Rq, task: &TaskRef) {
        let Some(current) = rq.current.clone() else { return };
        if current.class() != SchedClass::Fair {
            return;
        }
        let cur_vr = current.fair.lock().vruntime;
        let new_vr = task.fair.lock().vruntime;
        if new_vr + MIN_GRANULARITY_NS < cur_vr {
            rq.need_resched = true;
        }
    }

    fn pick_next_task(&self, rq: &mut Rq) -> Option<TaskRef> {
        rq.fair.tree.iter().next().map(|(_, t)| Arc::clone(t))
    }

    fn put_prev_task(&self, rq: &mut Rq, prev: &TaskRef) {
        if *prev.state.lock() == crate::sched::task::TaskState::Running && *prev.on_rq.lock() {
            // Still runnable: re-key in case its vruntime moved since it
            // was picked (update_curr runs before put_prev_task).
            let key = Self::key_of(prev);
            rq.fair.tree.insert(key, Arc::clone(prev));
        }
    }

    fn set_next_task(&self, rq: &mut Rq, task: &TaskRef, _first: bool) {
        let key = Self::key_of(task);
        rq.fair.tree.remove(&key);
        *task.exec_start_ns.lock() = khal::tsc::now_ns();
    }

    fn task_tick(&self, rq: &mut Rq, task: &TaskRef, _queued: bool) {
        self.update_curr(rq);
        let weight = task.fair.lock().weight;
        let ideal_slice = if rq.fair.nr_running > 0 {
            SCHED_LATENCY_NS / rq.fair.nr_running.max(1) as u64
        } else {
            SCHED_LATENCY_NS
        };
        let slice = ideal_slice.max(MIN_GRANULARITY_NS);
        let ran = khal::tsc::now_ns().saturating_sub(*task.exec_start_ns.lock());
        let _ = weight;
        if ran >= slice {
            rq.need_resched = true;
        }
        if let Some((_, leftmost)) = rq.fair.tree.iter().next() {
            if leftmost.fair.lock().vruntime + MIN_GRANULARITY_NS < task.fair.lock().vruntime {
                rq.need_resched = true;
            }
        }
    }

    fn task_fork(&self, rq: &mut Rq, task: &TaskRef) {
        self.place_entity(rq, task, true);
    }

    fn task_dead(&self, _task: &TaskRef) {}

    fn switched_from(&self, rq: &mut Rq, task: &TaskRef) {
        self.dequeue_task(rq, task, DequeueFlags::Migrate);
    }

    fn switched_to(&self, rq: &mut Rq, task: &TaskRef) {
        self.place_entity(rq, task, false);
    }

    fn prio_changed(&self, _rq: &mut Rq, task: &TaskRef, _old_prio: u8) {
        let nice = (task.effective_prio() as i32 - 120).clamp(-20, 19) as i8;
        let mut fair = task.fair.lock();
        fair.weight = nice_to_weight(nice);
    }

    fn select_task_rq(&self, task: &TaskRef, prev_cpu: usize) -> usize {
        crate::sched::balance::select_idle_or_least_loaded(prev_cpu, *task.cpu_affinity.lock())
    }

    fn migrate_task_rq(&self, task: &TaskRef, new_cpu: usize) {
        *task.on_cpu.lock() = new_cpu;
    }

    fn update_curr(&self, rq: &mut Rq) {
        let Some(current) = rq.current.clone() else { return };
        if current.class() != SchedClass::Fair {
            return;
        }
        let now = khal::tsc::now_ns();
        let mut start = current.exec_start_ns.lock();
        let delta = now.saturating_sub(*start);
        *start = now;
        drop(start);

        let mut fair = current.fair.lock();
        let weight = if fair.weight == 0 { NICE_0_WEIGHT } else { fair.weight };
        fair.sum_exec_runtime += delta;
        fair.vruntime += calc_delta_vruntime(delta, weight);
        let vr = fair.vruntime;
        drop(fair);

        // min_vruntime only ever increases — it tracks the slowest task
        // still making progress, so a task that sleeps a long time and
        // wakes up doesn't get placed far behind everyone else either.
        rq.fair.min_vruntime = rq.fair.min_vruntime.max(
            rq.fair.tree.keys().next().map(|(v, _)| *v).unwrap_or(vr).min(vr),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_zero_is_the_reference_weight() {
        assert_eq!(nice_to_weight(0), NICE_0_WEIGHT);
    }

    #[test]
    fn higher_nice_means_lower_weight() {
        assert!(nice_to_weight(5) < nice_to_weight(0));
        assert!(nice_to_weight(-5) > nice_to_weight(0));
    }

    #[test]
    fn nice_clamps_to_table_bounds() {
        assert_eq!(nice_to_weight(-100), nice_to_weight(-20));
        assert_eq!(nice_to_weight(100), nice_to_weight(19));
    }

    #[test]
    fn equal_weight_vruntime_tracks_wall_clock() {
        assert_eq!(calc_delta_vruntime(1_000_000, NICE_0_WEIGHT), 1_000_000);
    }

    #[test]
    fn heavier_task_accrues_vruntime_slower() {
        let heavy = calc_delta_vruntime(1_000_000, nice_to_weight(-5));
        let light = calc_delta_vruntime(1_000_000, nice_to_weight(5));
        assert!(heavy < light);
    }
}
