//! The scheduling entity every class operates on.
//!
//! Reuses the teacher's `Context`/`KernelStack`/`context_switch_asm` triple
//! from the old single-queue scheduler (`task::process`) unchanged — the
//! mechanics of suspending and resuming a kernel stack don't change when
//! the policy above them grows four classes. Everything above that layer
//! (state, priority, per-class bookkeeping, PI) is new.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::x86_64::fpu::FpuState;
use crate::memory::mm::AddressSpace;
use crate::sync::spinlock::SpinLock;

/// Size of each task's kernel-mode stack (32 KiB). Same budget the
/// teacher picked for nested interrupt frames plus scheduler bookkeeping.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

#[repr(C, align(16))]
pub struct KernelStack {
    pub data: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// Callee-saved register context for `context_switch_asm`. Layout must
/// match the push/pop order in the assembly below.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Self { r15: 0, r14: 0, r13: 0, r12: 0, rbx: 0, rbp: 0, rip: 0 }
    }
}

core::arch::global_asm!(
    ".global sched_context_switch_asm",
    "sched_context_switch_asm:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn sched_context_switch_asm(old_rsp_ptr: *mut u64, new_rsp: u64);
}

/// Perform a raw context switch between two kernel stacks.
///
/// # Safety
/// Both RSP values must point into valid, correctly laid-out kernel
/// stacks, and the caller must not hold any lock the target task's first
/// instructions might need to re-acquire.
pub unsafe fn raw_context_switch(old_rsp_ptr: *mut u64, new_rsp: u64) {
    unsafe { sched_context_switch_asm(old_rsp_ptr, new_rsp) };
}

/// Ceiling on live PIDs. Generous for a single-host kernel with no
/// container namespacing, but bounded so a fork bomb fails with
/// `SpawnError::OutOfPids` instead of wrapping the counter.
pub const MAX_PIDS: u64 = 1 << 20;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Error returned when a new task cannot be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// `MAX_PIDS` live PIDs have already been issued.
    OutOfPids,
}

/// Hand out the next PID, or `SpawnError::OutOfPids` once `MAX_PIDS` have
/// been issued. PIDs are never recycled, so this is a ceiling on total
/// tasks created over the kernel's lifetime, not just live ones at once —
/// generous enough that it only matters for a genuine runaway spawner.
pub fn alloc_pid() -> Result<u64, SpawnError> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    if pid >= MAX_PIDS {
        return Err(SpawnError::OutOfPids);
    }
    Ok(pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Which scheduling class currently owns this task. Classes are tried in
/// `dl, rt, fair, idle` order by the core dispatcher, so this also doubles
/// as the priority band (deadline tasks always beat a runnable RT task,
/// which always beats a runnable fair task).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedClass {
    Deadline = 0,
    RealTime = 1,
    Fair = 2,
    Idle = 3,
}

pub const SCHED_CLASS_ORDER: [SchedClass; 4] =
    [SchedClass::Deadline, SchedClass::RealTime, SchedClass::Fair, SchedClass::Idle];

/// RT scheduling policy, independent of the class: both FIFO and RR tasks
/// live in `sched::rt`, they just differ in whether their time slice
/// expiring rotates them to the back of their priority's run list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtPolicy {
    Fifo,
    RoundRobin,
}

/// CFS-class bookkeeping. `weight` is derived from the nice value via the
/// 40-entry table in `sched::fair`; `vruntime` is the virtual runtime used
/// to order the red-black tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairState {
    pub weight: u32,
    pub inv_weight: u32,
    pub vruntime: u64,
    pub sum_exec_runtime: u64,
}

/// RT-class bookkeeping: static priority 0..99 (0 highest), remaining
/// time slice for round-robin tasks, and the runqueue-local runtime used
/// against the `rt_runtime`/`rt_period` throttling cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtState {
    pub rt_prio: u8,
    pub policy_is_rr: bool,
    pub time_slice_ns: u64,
    pub runtime_used_ns: u64,
}

/// Deadline-class bookkeeping: the (runtime, deadline, period) triple an
/// EDF task is admitted with, plus the remaining runtime budget in the
/// current period and whether the task is currently throttled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlState {
    pub runtime_ns: u64,
    pub deadline_ns: u64,
    pub period_ns: u64,
    pub remaining_runtime_ns: u64,
    pub absolute_deadline_ns: u64,
    pub throttled: bool,
}

/// Priority-inheritance state, protected by its own lock so a remote core
/// can walk/boost a blocked owner's priority without taking the owner's
/// run queue lock first (that ordering is exactly backwards — see
/// `sched::pi`).
#[derive(Debug)]
pub struct PiState {
    /// Highest priority among tasks blocked on a lock this task holds, or
    /// `None` if nobody is waiting on it. Numerically lower is higher
    /// priority, matching `effective_prio`.
    pub waiters_top_prio: Option<u8>,
}

impl PiState {
    pub const fn new() -> Self {
        Self { waiters_top_prio: None }
    }
}

/// The scheduling entity. One per task; `Arc`-shared so run queues,
/// wait queues, and the PI graph can all hold a reference without a
/// single owner.
pub struct Task {
    pub pid: u64,
    pub name: String,

    pub state: SpinLock<TaskState>,

    /// `static_prio` never changes except via explicit nice/setscheduler
    /// calls; `normal_prio` is derived from it by each class;
    /// `effective_prio` is `normal_prio` boosted by priority inheritance.
    /// All three use the unified 0..139 numbering (0 = highest RT, 100 =
    /// nice 0 in the fair class), mirroring spec.md's priority space.
    pub static_prio: SpinLock<u8>,
    pub normal_prio: SpinLock<u8>,
    pub effective_prio: SpinLock<u8>,

    pub class: SpinLock<SchedClass>,
    pub rt_policy: RtPolicy,

    pub fair: SpinLock<FairState>,
    pub rt: SpinLock<RtState>,
    pub dl: SpinLock<DlState>,

    pub pi: SpinLock<PiState>,

    /// CPU affinity bitmap (bit i = may run on CPU i).
    pub cpu_affinity: SpinLock<u64>,
    /// CPU this task is currently queued/running on.
    pub on_cpu: SpinLock<usize>,
    pub on_rq: SpinLock<bool>,

    pub context: SpinLock<Context>,
    /// Saved kernel RSP for this task's suspended stack. Only ever
    /// touched by the one core currently executing a context switch that
    /// involves this task, under that core's run queue lock — a plain
    /// cell, not a spinlock, because `raw_context_switch` needs a raw
    /// pointer to it that outlives any guard's borrow.
    kernel_rsp: core::cell::UnsafeCell<u64>,
    pub kernel_stack: Box<KernelStack>,

    pub exec_start_ns: SpinLock<u64>,

    /// This task's own address space, or `None` for a kernel thread that
    /// has no user-space mappings of its own and just borrows whatever
    /// was last active (see `active_mm`).
    pub mm: SpinLock<Option<Arc<AddressSpace>>>,
    /// The address space actually installed in CR3 while this task runs.
    /// Equal to `mm` for a user task; for a kernel thread, it's whichever
    /// user task's `mm` was active on this CPU before it, carried forward
    /// so `schedule()` can skip the CR3 write when switching between two
    /// kernel threads back to back.
    pub active_mm: SpinLock<Option<Arc<AddressSpace>>>,

    /// Saved x87/MMX/XMM register file, restored on a switch back into
    /// this task.
    pub fpu: SpinLock<Box<FpuState>>,
    /// Whether this task has ever executed an FPU/SSE instruction.
    /// `schedule()` skips the `fxsave`/`fxrstor` pair entirely for tasks
    /// that never set this, e.g. `idle` and every other kernel-only task
    /// created by `try_new_kernel`.
    pub fpu_used: AtomicBool,

    /// Direct-handoff successor: the task `task_wake_up` decided should
    /// run next on this exact CPU, set on the outgoing task rather than
    /// just raising `need_resched`. `schedule()` takes this before
    /// falling back to a full `pick_next_task` scan across classes.
    pub handoff: SpinLock<Option<TaskRef>>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

pub type TaskRef = Arc<Task>;

impl Task {
    /// Create a kernel-only task (idle task, boot-time workers). Panics on
    /// `SpawnError` since these are fixed, bounded calls made once at boot,
    /// not a path a hostile or buggy caller can exhaust; general task
    /// creation should go through `try_new_kernel` and propagate the error.
    pub fn new_kernel(name: &str, entry: extern "C" fn() -> !) -> TaskRef {
        Self::try_new_kernel(name, entry).expect("Task::new_kernel: PID space exhausted at boot")
    }

    pub fn try_new_kernel(name: &str, entry: extern "C" fn() -> !) -> Result<TaskRef, SpawnError> {
        let pid = alloc_pid()?;
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("Task::new_kernel: failed to allocate kernel stack for PID {}", pid);
            }
            Box::from_raw(ptr)
        };

        let top = kernel_stack.top();
        let sp = top - 7 * 8;
        unsafe {
            let ptr = sp as *mut u64;
            ptr.add(0).write(0); // r15
            ptr.add(1).write(0); // r14
            ptr.add(2).write(0); // r13
            ptr.add(3).write(0); // r12
            ptr.add(4).write(0); // rbx
            ptr.add(5).write(0); // rbp
            ptr.add(6).write(entry as u64); // rip
        }

        Ok(Arc::new(Task {
            pid,
            name: String::from(name),
            state: SpinLock::new(TaskState::Ready),
            static_prio: SpinLock::new(100),
            normal_prio: SpinLock::new(100),
            effective_prio: SpinLock::new(100),
            class: SpinLock::new(SchedClass::Fair),
            rt_policy: RtPolicy::Fifo,
            fair: SpinLock::new(FairState::default()),
            rt: SpinLock::new(RtState::default()),
            dl: SpinLock::new(DlState::default()),
            pi: SpinLock::new(PiState::new()),
            cpu_affinity: SpinLock::new(u64::MAX),
            on_cpu: SpinLock::new(0),
            on_rq: SpinLock::new(false),
            context: SpinLock::new(Context::empty()),
            kernel_rsp: core::cell::UnsafeCell::new(sp),
            kernel_stack,
            exec_start_ns: SpinLock::new(0),
            mm: SpinLock::new(None),
            active_mm: SpinLock::new(None),
            fpu: SpinLock::new(Box::new(FpuState::new())),
            fpu_used: AtomicBool::new(false),
            handoff: SpinLock::new(None),
        }))
    }

    /// Raw pointer to this task's saved kernel RSP slot.
    ///
    /// # Safety
    /// The caller must hold this task's run queue lock (or otherwise know
    /// no other core is concurrently context-switching this task) before
    /// dereferencing the pointer.
    pub fn kernel_rsp_ptr(&self) -> *mut u64 {
        self.kernel_rsp.get()
    }

    pub fn class(&self) -> SchedClass {
        *self.class.lock()
    }

    pub fn effective_prio(&self) -> u8 {
        *self.effective_prio.lock()
    }

    pub fn set_effective_prio(&self, prio: u8) {
        *self.effective_prio.lock() = prio;
    }

    pub fn is_runnable(&self) -> bool {
        *self.state.lock() == TaskState::Ready || *self.state.lock() == TaskState::Running
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("class", &self.class())
            .finish()
    }
}
