// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Stride scheduler for the kestrel kernel
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (select/yield_current/set_priority), SchedError
//! DEPENDS_ON: task::ProcessTable, config (BIG_STRIDE)
//! INVARIANTS: Picks the Runnable slot with the smallest pass (ties to lowest pid);
//!             pass never decreases; at most one Running slot

use core::marker::PhantomData;

use crate::task::{Process, ProcessTable, ProcState};

#[cfg(test)]
mod tests_prop;

/// Scheduler-level errors.
#[must_use = "scheduler errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Priority below 2.
    InvalidArgument,
}

/// Stride scheduler over a [`ProcessTable`].
///
/// Stateless apart from statistics: `pass`, `stride` and priority live in the
/// process control blocks so `fork` and `exec` carry them along.
pub struct Scheduler {
    dispatches: u64,
    // Single-hart contract: the scheduler never crosses thread boundaries.
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { dispatches: 0, _not_send_sync: PhantomData }
    }

    /// Number of successful `select` calls so far.
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Picks the next process, marks it `Running` and makes it current.
    ///
    /// `now` is the clock in cycles; it becomes the start time on a process's
    /// first dispatch. Returns `None` when nothing is runnable.
    pub fn select(&mut self, table: &mut ProcessTable, now: u64) -> Option<usize> {
        let slot = table
            .iter()
            .filter(|(_, proc)| proc.state() == ProcState::Runnable)
            .min_by_key(|(_, proc)| (proc.pass(), proc.pid()))
            .map(|(slot, _)| slot)?;

        let proc = table.get_mut(slot)?;
        proc.state = ProcState::Running;
        if proc.start_time.is_none() {
            proc.start_time = Some(now);
        }
        proc.pass = proc.pass.saturating_add(proc.stride);
        log_trace!(target: "sched", "dispatch pid={} pass={}", proc.pid(), proc.pass);

        table.set_current(Some(slot));
        self.dispatches = self.dispatches.saturating_add(1);
        Some(slot)
    }

    /// Demotes the current process from `Running` to `Runnable`.
    pub fn yield_current(&self, table: &mut ProcessTable) {
        if let Ok(proc) = table.current_mut() {
            if proc.state == ProcState::Running {
                proc.state = ProcState::Runnable;
            }
        }
    }

    /// Applies `priority` to `proc`; values below 2 are rejected and leave
    /// the old stride in place.
    pub fn set_priority(&self, proc: &mut Process, priority: i64) -> Result<u64, SchedError> {
        if priority <= 1 {
            return Err(SchedError::InvalidArgument);
        }
        let priority = priority as u64;
        proc.set_priority(priority);
        log_debug!(target: "sched", "pid={} priority={} stride={}", proc.pid(), priority, proc.stride());
        Ok(priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BIG_STRIDE, DEFAULT_PRIORITY};

    fn runnable(table: &mut ProcessTable) -> usize {
        let slot = table.allocate().unwrap();
        table.get_mut(slot).unwrap().state = ProcState::Runnable;
        slot
    }

    #[test]
    fn select_on_empty_table_is_none() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        assert_eq!(sched.select(&mut table, 0), None);
        table.allocate().unwrap();
        assert_eq!(sched.select(&mut table, 0), None);
        assert_eq!(sched.dispatches(), 0);
    }

    #[test]
    fn ties_go_to_lowest_pid() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let first = runnable(&mut table);
        let second = runnable(&mut table);
        assert_eq!(sched.select(&mut table, 5), Some(first));
        sched.yield_current(&mut table);
        assert_eq!(sched.select(&mut table, 6), Some(second));
    }

    #[test]
    fn select_records_start_time_once_and_advances_pass() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let slot = runnable(&mut table);
        sched.select(&mut table, 100).unwrap();
        sched.yield_current(&mut table);
        sched.select(&mut table, 900).unwrap();
        let proc = table.get(slot).unwrap();
        assert_eq!(proc.state(), ProcState::Running);
        assert_eq!(proc.start_time(), Some(100));
        assert_eq!(proc.pass(), 2 * (BIG_STRIDE / DEFAULT_PRIORITY));
        assert_eq!(table.current_slot(), Some(slot));
    }

    #[test]
    fn yield_only_demotes_running() {
        let mut table = ProcessTable::new();
        let sched = Scheduler::new();
        let slot = table.allocate().unwrap();
        table.get_mut(slot).unwrap().state = ProcState::Sleeping;
        table.set_current(Some(slot));
        sched.yield_current(&mut table);
        assert_eq!(table.get(slot).unwrap().state(), ProcState::Sleeping);
    }

    #[test]
    fn set_priority_rejects_one_and_keeps_stride() {
        let mut table = ProcessTable::new();
        let sched = Scheduler::new();
        let slot = table.allocate().unwrap();
        let proc = table.get_mut(slot).unwrap();
        assert_eq!(sched.set_priority(proc, 2), Ok(2));
        assert_eq!(proc.stride(), BIG_STRIDE / 2);
        assert_eq!(sched.set_priority(proc, 1), Err(SchedError::InvalidArgument));
        assert_eq!(sched.set_priority(proc, -3), Err(SchedError::InvalidArgument));
        assert_eq!(proc.priority(), 2);
        assert_eq!(proc.stride(), BIG_STRIDE / 2);
    }

    #[test]
    fn higher_priority_runs_more_often() {
        let mut table = ProcessTable::new();
        let mut sched = Scheduler::new();
        let low = runnable(&mut table);
        let high = runnable(&mut table);
        sched.set_priority(table.get_mut(low).unwrap(), 2).unwrap();
        sched.set_priority(table.get_mut(high).unwrap(), 8).unwrap();

        let mut counts = [0u32; 2];
        for _ in 0..100 {
            let slot = sched.select(&mut table, 0).unwrap();
            counts[usize::from(slot == high)] += 1;
            sched.yield_current(&mut table);
        }
        assert_eq!(counts[0] + counts[1], 100);
        assert!((19..=21).contains(&counts[0]), "low ran {} times", counts[0]);
    }
}
