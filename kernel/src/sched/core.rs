//! The core dispatcher.
//!
//! Replaces the teacher's `task::process::{Scheduler::schedule, do_schedule}`
//! pair with the same two-layer shape — a policy step that figures out
//! what runs next, then a free function that drops every lock before the
//! actual context switch so the new task's first instructions can take
//! locks of their own without deadlocking — generalized across four
//! classes instead of one round-robin queue.
//!
//! `schedule()`'s steps (spec.md §4.F):
//!   0. if preemption is disabled on this CPU, just latch `need_resched`
//!      and return — the matching `preempt_enable` reschedules once the
//!      count drops back to zero
//!   1. lock this CPU's run queue
//!   2. `update_curr` on whatever's running, regardless of its class
//!   3. `put_prev_task`
//!   4. if nothing asked to preempt and the current task is still the
//!      highest-priority runnable one, return without switching;
//!      otherwise take the outgoing task's direct-handoff successor
//!      (`Task::handoff`) if it set one and it's still ready on this CPU,
//!      instead of falling through to a full class scan
//!   5. `pick_next_task`, trying classes in `dl, rt, fair, idle` order
//!   6. if idle was picked and the queue is otherwise empty, try
//!      `idle_balance` and re-pick
//!   7. `set_next_task`; switch address space if `next.mm != prev.active_mm`;
//!      save the outgoing task's FPU state if it ever used one; update
//!      this core's TSS RSP0; release the rq lock
//!   8. context switch

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::smp;
use crate::arch::x86_64::fpu;
use crate::sched::class::{DequeueFlags, EnqueueFlags, SchedClassOps};
use crate::sched::dl::DlClass;
use crate::sched::fair::FairClass;
use crate::sched::idle::IdleClass;
use crate::sched::rq::{rq, Rq};
use crate::sched::rt::RtClass;
use crate::sched::task::{SchedClass, Task, TaskRef, TaskState};
use crate::sync::spinlock::SpinLock;
use crate::traps::RESCHEDULE_VECTOR;

static FAIR: FairClass = FairClass;
static RT: RtClass = RtClass;
static DL: DlClass = DlClass;
static IDLE: IdleClass = IdleClass;

pub fn class_ops(class: SchedClass) -> &'static dyn SchedClassOps {
    match class {
        SchedClass::Deadline => &DL,
        SchedClass::RealTime => &RT,
        SchedClass::Fair => &FAIR,
        SchedClass::Idle => &IDLE,
    }
}

/// Per-CPU APIC id table, filled in by `init` from `arch::smp`, so a
/// remote wakeup/reschedule can address the right core's Local APIC.
static APIC_IDS: SpinLock<alloc::vec::Vec<u32>> = SpinLock::new(alloc::vec::Vec::new());

/// Per-CPU preemption-disable counter. `schedule()` latches `need_resched`
/// and returns without switching while a core's count is non-zero;
/// `preempt_enable` runs the deferred `schedule()` itself once the count
/// falls back to zero.
static PREEMPT_COUNT: [AtomicU32; smp::MAX_CORES] = {
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; smp::MAX_CORES]
};

fn preempt_count(cpu: usize) -> u32 {
    PREEMPT_COUNT[cpu].load(Ordering::SeqCst)
}

/// Disable preemption on the calling CPU. Nests: each call must be paired
/// with exactly one `preempt_enable`.
pub fn preempt_disable() {
    let cpu = smp::core_id() as usize;
    PREEMPT_COUNT[cpu].fetch_add(1, Ordering::SeqCst);
}

/// Re-enable preemption on the calling CPU. If this is the outermost
/// `preempt_enable` (count drops to zero) and something raised
/// `need_resched` while disabled, reschedule immediately instead of
/// waiting for the next tick or IPI.
pub fn preempt_enable() {
    let cpu = smp::core_id() as usize;
    let prev = PREEMPT_COUNT[cpu].fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "preempt_enable without a matching preempt_disable");
    if prev == 1 && rq(cpu).lock().need_resched {
        schedule();
    }
}

/// Whether two tasks' address spaces are the same installed PML4 (both
/// `None`, or both `Some` of the same `AddressSpace`).
fn same_address_space(
    a: &Option<Arc<crate::memory::mm::AddressSpace>>,
    b: &Option<Arc<crate::memory::mm::AddressSpace>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Bring up the scheduler: allocate one run queue and one idle task per
/// CPU, and build the scheduling-domain tree over them.
pub fn init(num_cpus: usize) {
    crate::sched::rq::init(num_cpus);
    crate::sched::domain::build_domains(num_cpus);

    let mut apic_ids = alloc::vec::Vec::with_capacity(num_cpus);
    for cpu in 0..num_cpus {
        let handle = rq(cpu);
        let idle = Task::new_kernel("idle", crate::sched::idle::idle_loop);
        *idle.class.lock() = SchedClass::Idle;
        *idle.state.lock() = TaskState::Running;
        handle.lock().idle_task = Some(idle);
        apic_ids.push(smp::core_local_apic_id(cpu));
    }
    *APIC_IDS.lock() = apic_ids;
}

/// Current CPU's highest-priority runnable class with something queued,
/// or `Idle` if every real class is empty.
fn pick_next_task(guard: &mut Rq) -> (SchedClass, TaskRef) {
    for &class in crate::sched::task::SCHED_CLASS_ORDER.iter() {
        if class == SchedClass::Idle {
            continue;
        }
        if let Some(task) = class_ops(class).pick_next_task(guard) {
            return (class, task);
        }
    }
    (SchedClass::Idle, guard.idle_task.clone().expect("idle task missing"))
}

fn total_nr_running(guard: &Rq) -> u32 {
    guard.fair.nr_running + guard.rt.nr_running + guard.dl.nr_running
}

/// The core dispatcher. May be called from process context (voluntary
/// yield, blocking) or from the timer/reschedule interrupt handlers.
///
/// # Safety-relevant invariant
/// Never holds `rq`'s lock across the actual `raw_context_switch` —
/// doing so would mean the next task to run this CPU can't take the lock
/// itself (e.g. from its own first tick) without deadlocking against a
/// lock its predecessor still held.
pub fn schedule() {
    let this_cpu = smp::core_id() as usize;
    let handle = rq(this_cpu);

    if preempt_count(this_cpu) > 0 {
        handle.lock().need_resched = true;
        return;
    }

    let (old_rsp_ptr, new_rsp, ready_to_drop) = {
        let mut guard = handle.lock();
        guard.clock_ns = khal::tsc::now_ns();

        // A task that died on this exact stack last time around couldn't
        // be freed then — we were still executing on it. Now we're
        // running on whatever stack this call to schedule() came in on,
        // so it's safe to drop.
        let stale_zombie = guard.zombie.take();

        let prev = guard.current.clone();
        if let Some(ref prev_task) = prev {
            class_ops(prev_task.class()).update_curr(&mut guard);
        }

        let need_resched = guard.need_resched;
        guard.need_resched = false;

        if let Some(ref prev_task) = prev {
            if !need_resched && *prev_task.state.lock() == TaskState::Running {
                return;
            }
            class_ops(prev_task.class()).put_prev_task(&mut guard, prev_task);
        }

        // Step 4: a direct-handoff successor set by `task_wake_up` takes
        // priority over a fresh class scan, as long as it's still ready
        // and was handed off on this exact CPU. `set_next_task` below
        // removes it from whichever ready structure it's still sitting
        // in, same as it would for anything `pick_next_task` returned.
        let handed_off = prev.as_ref().and_then(|p| p.handoff.lock().take()).filter(|t| {
            *t.on_cpu.lock() == this_cpu && *t.state.lock() == TaskState::Ready
        });

        let (mut next_class, mut next) = match handed_off {
            Some(t) => (t.class(), t),
            None => pick_next_task(&mut guard),
        };

        if next_class == SchedClass::Idle && total_nr_running(&guard) == 0 {
            drop(guard);
            let pulled = crate::sched::balance::idle_balance(this_cpu);
            guard = handle.lock();
            if pulled > 0 {
                let (c, t) = pick_next_task(&mut guard);
                next_class = c;
                next = t;
            }
        }

        if let Some(ref prev_task) = prev {
            if Arc::ptr_eq(prev_task, &next) {
                class_ops(next_class).set_next_task(&mut guard, &next, false);
                guard.current = Some(next);
                return;
            }
        }

        class_ops(next_class).set_next_task(&mut guard, &next, prev.is_none());
        *next.state.lock() = TaskState::Running;
        *next.on_cpu.lock() = this_cpu;

        // Step 7b: only touch CR3 when the address space actually backing
        // `next` differs from what's currently installed. A kernel thread
        // (`mm` is `None`) just inherits whatever was active already.
        let next_mm = next.mm.lock().clone();
        let prev_active_mm = prev.as_ref().and_then(|p| p.active_mm.lock().clone());
        match next_mm {
            Some(ref space) => {
                if !same_address_space(&Some(space.clone()), &prev_active_mm) {
                    unsafe { space.switch_to() };
                }
                *next.active_mm.lock() = Some(space.clone());
            }
            None => {
                *next.active_mm.lock() = prev_active_mm;
            }
        }

        // Step 7c: save the outgoing task's FPU/SSE state if it ever used
        // one, and restore the incoming task's. Tasks that never touch
        // FPU/XMM registers (idle, most kernel threads) skip both sides.
        if let Some(ref prev_task) = prev {
            if prev_task.fpu_used.load(Ordering::Relaxed) {
                unsafe { fpu::save(&mut prev_task.fpu.lock()) };
            }
        }
        if next.fpu_used.load(Ordering::Relaxed) {
            unsafe { fpu::restore(&next.fpu.lock()) };
        }

        guard.current = Some(next.clone());

        let new_stack_top = next.kernel_stack.top();
        smp::set_kernel_rsp0(this_cpu, new_stack_top);

        let prev_is_dead = prev.as_ref().map_or(false, |p| *p.state.lock() == TaskState::Dead);

        let old_rsp_ptr = match prev {
            Some(ref p) => p.kernel_rsp_ptr(),
            None => &mut guard.boot_rsp as *mut u64,
        };
        let new_rsp = unsafe { *next.kernel_rsp_ptr() };

        // If prev died, its Arc (and kernel stack) must outlive the
        // switch away from its own stack below, so park it in the
        // zombie slot instead of dropping it here.
        if prev_is_dead {
            guard.zombie = prev;
        }

        (old_rsp_ptr, new_rsp, stale_zombie)
        // rq lock dropped here
    };

    drop(ready_to_drop);

    unsafe {
        crate::sched::task::raw_context_switch(old_rsp_ptr, new_rsp);
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Timer-driven per-tick accounting, called from `traps::handlers::timer_handler`.
pub fn scheduler_tick() {
    let this_cpu = smp::core_id() as usize;
    let handle = rq(this_cpu);
    let now = khal::tsc::now_ns();

    let woken = {
        let mut guard = handle.lock();
        guard.clock_ns = now;
        if let Some(current) = guard.current.clone() {
            class_ops(current.class()).task_tick(&mut guard, &current, true);
        }
        let mut woken = alloc::vec::Vec::new();
        guard.sleeping.retain(|(deadline_ns, task)| {
            if *deadline_ns <= now {
                woken.push(task.clone());
                false
            } else {
                true
            }
        });
        woken
    };

    for task in &woken {
        task_wake_up(task);
    }

    crate::sched::balance::periodic_balance(this_cpu, now);

    if handle.lock().need_resched {
        schedule();
    }
}

/// Set by the reschedule-IPI handler: force this CPU back into
/// `schedule()` next time it's safe to (the next tick, or the next time
/// it returns from whatever interrupt delivered this one).
pub fn set_need_resched() {
    let this_cpu = smp::core_id() as usize;
    rq(this_cpu).lock().need_resched = true;
}

/// Admit a brand-new task into the scheduler (fork/spawn path).
pub fn wake_up_new_task(task: TaskRef) {
    let target_cpu = class_ops(task.class()).select_task_rq(&task, smp::core_id() as usize);
    *task.on_cpu.lock() = target_cpu;
    let handle = rq(target_cpu);
    let mut guard = handle.lock();
    class_ops(task.class()).task_fork(&mut guard, &task);
    guard.nr_running += 1;
    if let Some(current) = guard.current.clone() {
        class_ops(task.class()).check_preempt_curr(&mut guard, &task);
        let _ = current;
    }
    let need_resched = guard.need_resched;
    drop(guard);

    if need_resched {
        notify_cpu(target_cpu);
    }
}

/// Wake a blocked task: pick its run queue, enqueue it, and check whether
/// it should preempt whatever that CPU is currently running. Sends a
/// reschedule IPI if the target CPU isn't the one calling this.
pub fn task_wake_up(task: &TaskRef) {
    {
        let mut state = task.state.lock();
        if *state == TaskState::Running || *state == TaskState::Ready {
            return;
        }
        *state = TaskState::Ready;
    }

    let prev_cpu = *task.on_cpu.lock();
    let target_cpu = class_ops(task.class()).select_task_rq(task, prev_cpu);

    let handle = rq(target_cpu);
    let mut guard = handle.lock();
    class_ops(task.class()).enqueue_task(&mut guard, task, EnqueueFlags::Wakeup);
    guard.nr_running += 1;
    class_ops(task.class()).check_preempt_curr(&mut guard, task);
    let need_resched = guard.need_resched;

    // Same-CPU wakeup that's about to preempt: hand the waker its
    // successor directly instead of leaving it to a fresh class scan.
    if need_resched && target_cpu == smp::core_id() as usize {
        if let Some(current) = guard.current.clone() {
            *current.handoff.lock() = Some(task.clone());
        }
    }

    drop(guard);

    if need_resched {
        notify_cpu(target_cpu);
    }
}

/// Block the currently running task: remove it from its run queue and
/// switch away. The caller is responsible for arranging for something
/// else to call `task_wake_up` on it later.
pub fn block_current() {
    let this_cpu = smp::core_id() as usize;
    let handle = rq(this_cpu);
    let mut guard = handle.lock();
    if let Some(current) = guard.current.clone() {
        *current.state.lock() = TaskState::Blocked;
        class_ops(current.class()).dequeue_task(&mut guard, &current, DequeueFlags::Sleep);
        guard.nr_running = guard.nr_running.saturating_sub(1);
    }
    drop(guard);
    schedule();
}

/// Block the current task until `deadline_ns` (absolute, `khal::tsc::now_ns`
/// timebase) or until some other wakeup reaches it first, whichever comes
/// first. `scheduler_tick` is what actually wakes a task whose deadline has
/// passed — there's no one-shot hardware timer free to arm per sleeper
/// alongside the periodic preemption tick already driving this CPU.
fn sleep_until(deadline_ns: u64) -> u64 {
    let this_cpu = smp::core_id() as usize;
    let handle = rq(this_cpu);
    {
        let mut guard = handle.lock();
        let Some(current) = guard.current.clone() else { return 0 };
        *current.state.lock() = TaskState::Blocked;
        class_ops(current.class()).dequeue_task(&mut guard, &current, DequeueFlags::Sleep);
        guard.nr_running = guard.nr_running.saturating_sub(1);
        guard.sleeping.push((deadline_ns, current));
    }
    schedule();
    deadline_ns.saturating_sub(khal::tsc::now_ns())
}

/// Block the calling task for at least `ns` nanoseconds. Returns the
/// nanoseconds left on the deadline if woken early by something other than
/// the deadline itself (always 0 today — nothing delivers signals yet, so
/// a `schedule_timeout` sleeper only ever wakes via its own deadline or an
/// explicit `task_wake_up` on it).
pub fn schedule_timeout(ns: u64) -> u64 {
    sleep_until(khal::tsc::now_ns() + ns)
}

/// Sleep for exactly `ns` nanoseconds, uninterruptibly.
pub fn task_sleep(ns: u64) {
    let _ = schedule_timeout(ns);
}

/// Sleep for `ms` milliseconds, uninterruptibly.
pub fn msleep(ms: u64) {
    task_sleep(ms.saturating_mul(1_000_000));
}

/// Sleep for `ms` milliseconds; returns the milliseconds left to sleep if
/// woken early.
pub fn msleep_interruptible(ms: u64) -> u64 {
    schedule_timeout(ms.saturating_mul(1_000_000)) / 1_000_000
}

/// Voluntarily reschedule if another task wants the CPU, without blocking.
/// A no-op when nothing has raised `need_resched` on this core.
pub fn cond_resched() {
    let this_cpu = smp::core_id() as usize;
    if rq(this_cpu).lock().need_resched {
        schedule();
    }
}

/// Mark the currently running task dead and switch away; the task's
/// `Arc` is dropped once every reference (including the one `schedule()`
/// holds in `prev` during the final switch away from it) goes out of
/// scope.
pub fn exit_current() {
    let this_cpu = smp::core_id() as usize;
    let handle = rq(this_cpu);
    let mut guard = handle.lock();
    if let Some(current) = guard.current.clone() {
        *current.state.lock() = TaskState::Dead;
        class_ops(current.class()).dequeue_task(&mut guard, &current, DequeueFlags::Dead);
        class_ops(current.class()).task_dead(&current);
        guard.nr_running = guard.nr_running.saturating_sub(1);
    }
    drop(guard);
    schedule();
}

/// Send `vector` to every core except the caller's. Used by the page-table
/// engine to drive its TLB shootdown protocol; piggybacks on the same
/// per-CPU APIC id table the reschedule IPI uses.
pub fn broadcast_ipi_all_but_self(vector: u8) {
    let this_apic_id = smp::core_local_apic_id(smp::core_id() as usize);
    let apic_ids = APIC_IDS.lock().clone();
    khal::apic::send_ipi_all_but_self(this_apic_id, &apic_ids, vector);
}

fn notify_cpu(cpu: usize) {
    if cpu == smp::core_id() as usize {
        set_need_resched();
        return;
    }
    let apic_id = APIC_IDS.lock().get(cpu).copied();
    if let Some(apic_id) = apic_id {
        khal::apic::send_ipi(apic_id, RESCHEDULE_VECTOR);
    }
}
