//! The load balancer.
//!
//! Three entry points, all converging on `load_balance_domain`:
//!   - `scheduler_tick` calls `periodic_balance` at each domain's own
//!     interval, staggered per CPU so every core doesn't hit the same
//!     domain's lock in the same tick.
//!   - `select_idle_or_least_loaded` is consulted by the fair class's
//!     `select_task_rq` on every wakeup/fork.
//!   - `idle_balance` runs when a CPU's `schedule()` finds nothing to run:
//!     it pulls at least one task from the busiest CPU in its domain
//!     rather than go idle while another CPU is overloaded.

use crate::sched::domain::{domains, SchedDomain};
use crate::sched::rq::{double_lock, move_task_to_cpu, rq, Rq};

/// Load figure for one run queue: fair-class weighted load plus one unit
/// per runnable RT/DL task (their CPU cost isn't captured by CFS weight,
/// but they still occupy the core).
fn rq_load(q: &Rq) -> u64 {
    q.fair.load_weight + (q.rt.nr_running as u64 + q.dl.nr_running as u64) * crate::sched::fair::NICE_0_WEIGHT as u64
}

fn rq_nr_running(q: &Rq) -> u32 {
    q.nr_running
}

fn cpus_in_mask(mask: u64, num_cpus: usize) -> impl Iterator<Item = usize> {
    (0..num_cpus).filter(move |cpu| mask & (1u64 << cpu) != 0)
}

/// Pick a CPU for a task to wake up / be forked onto: prefer an idle CPU
/// in the affinity mask, otherwise the least-loaded one.
pub fn select_idle_or_least_loaded(prev_cpu: usize, affinity_mask: u64) -> usize {
    let num_cpus = crate::sched::rq::num_cpus();
    if num_cpus == 0 {
        return prev_cpu;
    }

    let mut best_cpu = prev_cpu;
    let mut best_load = u64::MAX;

    for cpu in cpus_in_mask(affinity_mask, num_cpus) {
        let handle = rq(cpu);
        let guard = handle.lock();
        if rq_nr_running(&guard) == 0 {
            return cpu;
        }
        let load = rq_load(&guard);
        if load < best_load {
            best_load = load;
            best_cpu = cpu;
        }
    }
    best_cpu
}

/// Run the imbalance check and, if warranted, migrate tasks from the
/// busiest CPU in `domain` to `this_cpu`.
///
/// Imbalance formula (spec.md §4.G): migrate only if
/// `remote_load > local_load + local_load/4 + one_nice_0_unit` — the
/// quarter-load slack and one-unit floor keep the balancer from thrashing
/// tasks back and forth over noise-level differences.
fn load_balance_domain(this_cpu: usize, domain: &SchedDomain, force_pull: bool) -> usize {
    let num_cpus = crate::sched::rq::num_cpus();
    let this_handle = rq(this_cpu);

    let mut busiest_cpu = None;
    let mut busiest_load = 0u64;
    for cpu in cpus_in_mask(domain.cpu_mask, num_cpus) {
        if cpu == this_cpu {
            continue;
        }
        let handle = rq(cpu);
        let load = rq_load(&handle.lock());
        if load > busiest_load {
            busiest_load = load;
            busiest_cpu = Some(cpu);
        }
    }

    let Some(busiest_cpu) = busiest_cpu else { return 0 };
    if busiest_cpu == this_cpu {
        return 0;
    }

    let local_load = rq_load(&this_handle.lock());
    let one_unit = crate::sched::fair::NICE_0_WEIGHT as u64;
    let threshold = local_load + local_load / 4 + one_unit;

    if !force_pull && busiest_load <= threshold {
        return 0;
    }

    let busiest_handle = rq(busiest_cpu);
    let (mut local, mut busiest) = double_lock(&this_handle, &busiest_handle);

    let mut migrated = 0;
    let max_pull = if force_pull { 1 } else { 4 };

    loop {
        if migrated >= max_pull {
            break;
        }
        if !force_pull && rq_load(&busiest) <= rq_load(&local) {
            break;
        }
        let Some((_, task)) = busiest.fair.tree.iter().next().map(|(k, v)| (*k, v.clone())) else {
            break;
        };
        if *task.cpu_affinity.lock() & (1u64 << this_cpu) == 0 {
            break;
        }

        move_task_to_cpu(&mut busiest, &mut local, this_cpu, &task);
        migrated += 1;
    }

    migrated
}

/// Per-CPU phase offset for a domain's balance interval, so every core in
/// the same domain doesn't wake up and contend for the same remote rq
/// locks on the same tick. Spreads CPUs evenly across one interval: CPU 0
/// balances on the interval boundary, CPU 1 a fraction of the interval
/// later, and so on, wrapping back to 0 once every CPU has an offset.
pub fn stagger_offset(cpu_id: usize, interval_ns: u64) -> u64 {
    stagger_offset_for(crate::sched::rq::num_cpus(), cpu_id, interval_ns)
}

fn stagger_offset_for(num_cpus: usize, cpu_id: usize, interval_ns: u64) -> u64 {
    let num_cpus = num_cpus.max(1) as u64;
    (interval_ns / num_cpus) * (cpu_id as u64 % num_cpus)
}

/// Called from `scheduler_tick`: walk every domain this CPU belongs to
/// and run a balance pass on whichever ones are due.
pub fn periodic_balance(this_cpu: usize, now_ns: u64) {
    let handle = rq(this_cpu);
    for domain in domains() {
        if domain.cpu_mask & (1u64 << this_cpu) == 0 {
            continue;
        }
        let due = {
            let guard = handle.lock();
            guard.next_balance_ns == 0 || now_ns >= guard.next_balance_ns
        };
        if !due {
            continue;
        }
        load_balance_domain(this_cpu, domain, false);
        let offset = stagger_offset(this_cpu, domain.balance_interval_ns);
        handle.lock().next_balance_ns = now_ns + domain.balance_interval_ns + offset;
    }
}

/// Called when `this_cpu` is about to go idle with nothing runnable: pull
/// at least one task from the busiest CPU in the cheapest domain that has
/// one to give, rather than idle while another core is overloaded.
pub fn idle_balance(this_cpu: usize) -> u32 {
    for domain in domains() {
        if domain.cpu_mask & (1u64 << this_cpu) == 0 {
            continue;
        }
        let pulled = load_balance_domain(this_cpu, domain, true);
        if pulled > 0 {
            return pulled;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_zero_never_waits() {
        assert_eq!(stagger_offset_for(4, 0, 4_000_000), 0);
    }

    #[test]
    fn offsets_spread_evenly_across_the_interval() {
        let interval = 4_000_000;
        let offsets: alloc::vec::Vec<u64> =
            (0..4).map(|cpu| stagger_offset_for(4, cpu, interval)).collect();
        assert_eq!(offsets, alloc::vec![0, 1_000_000, 2_000_000, 3_000_000]);
    }

    #[test]
    fn wraps_when_cpu_id_exceeds_count() {
        assert_eq!(stagger_offset_for(4, 5, 4_000_000), stagger_offset_for(4, 1, 4_000_000));
    }
}
