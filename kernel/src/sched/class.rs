//! The scheduling-class vtable.
//!
//! The teacher's original scheduler (`task::process::Scheduler`) hardwired
//! one policy — round robin — directly into `schedule()`. Splitting that
//! into four policies (deadline, real-time, fair, idle) means the core
//! dispatcher in `sched::core` can no longer know which policy it's
//! talking to; it calls through this trait instead, same shape as the
//! `Scheduler::push`/`schedule`/`reap_dead` methods it replaces, just
//! uniform across classes.
//!
//! Every hook takes the already-locked run queue (`&mut Rq`) the task
//! belongs to — callers in `sched::core` are responsible for holding the
//! right lock before dispatching here.

use crate::sched::rq::Rq;
use crate::sched::task::TaskRef;

/// Reason a task is being enqueued, mirrored from spec.md's wake/fork/
/// migrate distinctions so a class can special-case (e.g. fair tasks
/// entering due to `task_fork` start at `min_vruntime`, not at the
/// vruntime they'd get from a plain wakeup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueFlags {
    Wakeup,
    Fork,
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueFlags {
    Sleep,
    Migrate,
    Dead,
}

/// One scheduling class's policy. Implemented by `fair::FairClass`,
/// `rt::RtClass`, `dl::DlClass`, `idle::IdleClass`.
pub trait SchedClassOps: Sync {
    /// Add `task` to this class's ready state on `rq`.
    fn enqueue_task(&self, rq: &mut Rq, task: &TaskRef, flags: EnqueueFlags);

    /// Remove `task` from this class's ready state on `rq`.
    fn dequeue_task(&self, rq: &mut Rq, task: &TaskRef, flags: DequeueFlags);

    /// The running task voluntarily gives up the CPU for this tick
    /// (`sched_yield`): re-insert it at the back of its priority band.
    fn yield_task(&self, rq: &mut Rq);

    /// A task just became runnable on `rq` (or changed priority) while
    /// `rq.current` is running a lower-priority task. Set `rq.need_resched`
    /// if `task` should preempt it.
    fn check_preempt_curr(&self, rq: &mut Rq, task: &TaskRef);

    /// Choose the next task this class wants to run on `rq`, or `None` if
    /// the class has nothing runnable. The core dispatcher tries classes
    /// in priority order and stops at the first `Some`.
    fn pick_next_task(&self, rq: &mut Rq) -> Option<TaskRef>;

    /// The previously running task is being switched away from; update
    /// its class-specific accounting (e.g. fair's `vruntime`) one last
    /// time and, if still runnable, leave it queued.
    fn put_prev_task(&self, rq: &mut Rq, prev: &TaskRef);

    /// `task` has just been chosen by `pick_next_task` (possibly from a
    /// different class than last time); stamp `exec_start` and any
    /// per-class state that depends on "I am now running".
    fn set_next_task(&self, rq: &mut Rq, task: &TaskRef, first: bool);

    /// Periodic tick (from `scheduler_tick`) while `task` is running on
    /// `rq`: update runtime accounting and decide whether to set
    /// `need_resched`.
    fn task_tick(&self, rq: &mut Rq, task: &TaskRef, queued: bool);

    /// A new task is being admitted via fork/spawn.
    fn task_fork(&self, rq: &mut Rq, task: &TaskRef);

    /// A task has exited; release any class-held resources (DL bandwidth,
    /// RT runtime reservation).
    fn task_dead(&self, task: &TaskRef);

    /// `task` is leaving this class for another (policy change).
    fn switched_from(&self, rq: &mut Rq, task: &TaskRef);

    /// `task` is entering this class from another.
    fn switched_to(&self, rq: &mut Rq, task: &TaskRef);

    /// `task`'s priority changed while already a member of this class.
    fn prio_changed(&self, rq: &mut Rq, task: &TaskRef, old_prio: u8);

    /// Choose which CPU's run queue `task` should wake up on. Consulted
    /// by `task_wake_up` before the double-rq-lock; classes without a
    /// load-aware placement (RT, DL, idle) just return the task's current
    /// CPU or its previous CPU.
    fn select_task_rq(&self, task: &TaskRef, prev_cpu: usize) -> usize;

    /// `task` is being moved from one run queue to another by the load
    /// balancer; update any per-rq aggregate this class maintains (e.g.
    /// fair's per-rq load sum).
    fn migrate_task_rq(&self, task: &TaskRef, new_cpu: usize);

    /// Update `task`'s runtime accounting against the wall clock; called
    /// by the core dispatcher at the top of `schedule()` on whichever task
    /// is current, regardless of which class ends up picked next.
    fn update_curr(&self, rq: &mut Rq);
}
