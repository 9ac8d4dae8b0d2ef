//! Per-CPU run queue.
//!
//! The teacher kept one global `VecDeque<Process>` behind a single
//! `spin::Mutex` (`task::process::SCHEDULER`). That doesn't scale past one
//! core and can't express per-class ready state, so each CPU now gets its
//! own `Rq`, holding one sub-queue per scheduling class plus the fields
//! the core dispatcher needs (current task, need-resched flag, clock).
//!
//! Lock-ordering discipline (extends the hierarchy documented in
//! `sync::mod`): a task's `pi` lock is always acquired before any `Rq`
//! lock; when two run queues must be locked together (load balancing,
//! remote wakeup), they are locked in ascending `cpu_id` order to avoid
//! ABBA deadlocks.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use crate::sched::task::{SchedClass, TaskRef};
use crate::sync::spinlock::SpinLock;

pub const RT_PRIO_LEVELS: usize = 100;

/// CFS-style ready tree for the fair class. A `BTreeMap` keyed by
/// `(vruntime, pid)` gives the same "leftmost = lowest vruntime, tie broken
/// by insertion order" semantics as a red-black tree without hand-rolling
/// one in a freestanding binary.
pub struct FairRq {
    pub tree: BTreeMap<(u64, u64), TaskRef>,
    pub min_vruntime: u64,
    pub load_weight: u64,
    pub nr_running: u32,
}

impl FairRq {
    pub const fn new() -> Self {
        Self { tree: BTreeMap::new(), min_vruntime: 0, load_weight: 0, nr_running: 0 }
    }
}

/// RT ready queues: one FIFO run list per priority level (0 = highest),
/// plus a bitmap so `pick_next_task` finds the highest non-empty level in
/// O(1) instead of scanning 100 entries.
pub struct RtRq {
    pub queues: [VecDeque<TaskRef>; RT_PRIO_LEVELS],
    pub bitmap: u128,
    pub nr_running: u32,
    /// Runtime consumed by RT tasks in the current `rt_period_ns` window,
    /// reset by the bandwidth-replenishment timer in `sched::core`.
    pub rt_time_used_ns: u64,
    pub rt_runtime_ns: u64,
    pub rt_period_ns: u64,
}

impl RtRq {
    pub fn new() -> Self {
        const EMPTY: VecDeque<TaskRef> = VecDeque::new();
        Self {
            queues: [EMPTY; RT_PRIO_LEVELS],
            bitmap: 0,
            nr_running: 0,
            rt_time_used_ns: 0,
            // 95% of each 1s period, matching the conventional RT
            // throttling default (leaves 5% for non-RT tasks even if an
            // RT task never blocks).
            rt_runtime_ns: 950_000_000,
            rt_period_ns: 1_000_000_000,
        }
    }
}

/// Deadline ready tree, ordered by absolute deadline (earliest first —
/// EDF). `total_bandwidth` is the running sum of `runtime/period` for
/// every admitted DL task on this CPU, checked against the admission cap
/// in `sched::dl` before a new task is accepted.
pub struct DlRq {
    pub tree: BTreeMap<(u64, u64), TaskRef>,
    pub nr_running: u32,
    pub total_bandwidth_q32: u64,
}

impl DlRq {
    pub const fn new() -> Self {
        Self { tree: BTreeMap::new(), nr_running: 0, total_bandwidth_q32: 0 }
    }
}

pub struct Rq {
    pub cpu_id: usize,
    pub current: Option<TaskRef>,
    pub idle_task: Option<TaskRef>,
    /// A task that died on this CPU's own stack, held here instead of
    /// dropped immediately: freeing it would deallocate the kernel stack
    /// the dispatcher is still executing on. The next `schedule()` call on
    /// this CPU — now running on a different task's stack — drops it.
    pub zombie: Option<TaskRef>,

    pub fair: FairRq,
    pub rt: RtRq,
    pub dl: DlRq,

    pub nr_running: u32,
    pub need_resched: bool,
    pub clock_ns: u64,
    pub next_balance_ns: u64,

    /// Tasks blocked in `schedule_timeout`/`task_sleep`/`msleep`, each
    /// keyed by its absolute wake deadline (`clock_ns` timebase). Checked
    /// against `clock_ns` on every `scheduler_tick`, since there's no
    /// one-shot LAPIC mode in use alongside the periodic preemption tick.
    pub sleeping: alloc::vec::Vec<(u64, TaskRef)>,

    /// Scratch slot for the outgoing stack pointer the very first time
    /// this CPU calls `schedule()` with no `current` task yet (there is
    /// no `Task::kernel_rsp` to save it into). One per CPU, not a shared
    /// global, since every core hits this path independently during SMP
    /// bring-up.
    pub boot_rsp: u64,
}

impl Rq {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            current: None,
            idle_task: None,
            zombie: None,
            fair: FairRq::new(),
            rt: RtRq::new(),
            dl: DlRq::new(),
            nr_running: 0,
            need_resched: false,
            clock_ns: 0,
            next_balance_ns: 0,
            sleeping: alloc::vec::Vec::new(),
            boot_rsp: 0,
        }
    }

    pub fn class_of(task: &TaskRef) -> SchedClass {
        task.class()
    }
}

/// One `Rq` per CPU, each behind its own lock so an idle core balancing
/// load doesn't contend with a busy core's tick handler.
static RUN_QUEUES: SpinLock<Option<alloc::vec::Vec<Arc<SpinLock<Rq>>>>> = SpinLock::new(None);

pub fn init(num_cpus: usize) {
    let mut queues = alloc::vec::Vec::with_capacity(num_cpus);
    for cpu in 0..num_cpus {
        queues.push(Arc::new(SpinLock::new(Rq::new(cpu))));
    }
    *RUN_QUEUES.lock() = Some(queues);
}

pub fn rq(cpu: usize) -> Arc<SpinLock<Rq>> {
    let guard = RUN_QUEUES.lock();
    let queues = guard.as_ref().expect("sched::rq::init not called");
    queues[cpu].clone()
}

pub fn num_cpus() -> usize {
    RUN_QUEUES.lock().as_ref().map_or(0, |q| q.len())
}

/// Migrate one task between two already-locked run queues, via its
/// scheduling class's dequeue/migrate/enqueue hooks. Callers (the load
/// balancer, and any future explicit CPU-pin request) must lock `from`
/// and `to` with `double_lock` first; this function does not touch
/// `nr_running` bookkeeping beyond what the class hooks themselves do.
pub fn move_task_to_cpu(from: &mut Rq, to: &mut Rq, to_cpu: usize, task: &TaskRef) {
    let ops = crate::sched::core::class_ops(task.class());
    ops.dequeue_task(from, task, crate::sched::class::DequeueFlags::Migrate);
    ops.migrate_task_rq(task, to_cpu);
    ops.enqueue_task(to, task, crate::sched::class::EnqueueFlags::Migrate);
}

/// Lock two run queues in a fixed, deterministic order (ascending CPU id)
/// to avoid ABBA deadlocks, returning guards in `(a, b)`'s caller-supplied
/// order regardless of which one physically locked first.
pub fn double_lock<'a>(
    a: &'a SpinLock<Rq>,
    b: &'a SpinLock<Rq>,
) -> (crate::sync::spinlock::SpinLockGuard<'a, Rq>, crate::sync::spinlock::SpinLockGuard<'a, Rq>) {
    let a_addr = a as *const _ as usize;
    let b_addr = b as *const _ as usize;
    if a_addr < b_addr {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
