//! The idle scheduling class.
//!
//! Every CPU has exactly one idle task, created once at boot and never
//! destroyed; it never appears on any ready queue and is never enqueued
//! or dequeued through the normal class hooks. `pick_next_task` always
//! succeeds, which is what lets `sched::core::pick_next_task` try classes
//! in order and be guaranteed to get something back — the core
//! dispatcher never has to handle "no task to run".
//!
//! Replaces the teacher's implicit behavior of `do_schedule` silently
//! returning when its single `VecDeque` was empty (which just kept
//! running whatever was current, including busy-looping a dead task);
//! here there's always an explicit idle task to fall back to.

use crate::sched::class::{DequeueFlags, EnqueueFlags, SchedClassOps};
use crate::sched::rq::Rq;
use crate::sched::task::TaskRef;

pub struct IdleClass;

impl SchedClassOps for IdleClass {
    fn enqueue_task(&self, _rq: &mut Rq, _task: &TaskRef, _flags: EnqueueFlags) {}
    fn dequeue_task(&self, _rq: &mut Rq, _task: &TaskRef, _flags: DequeueFlags) {}
    fn yield_task(&self, _rq: &mut Rq) {}
    fn check_preempt_curr(&self, _rq: &mut Rq, _task: &TaskRef) {}

    fn pick_next_task(&self, rq: &mut Rq) -> Option<TaskRef> {
        rq.idle_task.clone()
    }

    fn put_prev_task(&self, _rq: &mut Rq, _prev: &TaskRef) {}

    fn set_next_task(&self, _rq: &mut Rq, task: &TaskRef, _first: bool) {
        *task.exec_start_ns.lock() = khal::tsc::now_ns();
    }

    fn task_tick(&self, rq: &mut Rq, _task: &TaskRef, _queued: bool) {
        // Idle runs forever until something else becomes runnable; any
        // non-idle enqueue already sets need_resched via check_preempt_curr.
        let _ = rq;
    }

    fn task_fork(&self, _rq: &mut Rq, _task: &TaskRef) {
        unreachable!("the idle task is never forked");
    }

    fn task_dead(&self, _task: &TaskRef) {}
    fn switched_from(&self, _rq: &mut Rq, _task: &TaskRef) {}
    fn switched_to(&self, _rq: &mut Rq, _task: &TaskRef) {}
    fn prio_changed(&self, _rq: &mut Rq, _task: &TaskRef, _old_prio: u8) {}

    fn select_task_rq(&self, _task: &TaskRef, prev_cpu: usize) -> usize {
        prev_cpu
    }

    fn migrate_task_rq(&self, _task: &TaskRef, _new_cpu: usize) {}

    fn update_curr(&self, _rq: &mut Rq) {}
}

/// The body every per-CPU idle task runs: enable interrupts, halt until
/// one arrives, then ask the dispatcher if there's now something better
/// to run. `schedule()` is what actually notices `need_resched` and
/// switches away.
pub extern "C" fn idle_loop() -> ! {
    loop {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
        crate::arch::x86_64::cpu::halt();
        crate::sched::core::schedule();
    }
}
