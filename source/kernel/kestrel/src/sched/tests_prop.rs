// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the stride scheduler
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - proportional share between processes of different priorities
//!   - no starvation of any runnable process
//!   - pass values never decrease
//!
//! TEST_SCENARIOS:
//!   - pass_spread_is_bounded_by_max_stride(): count * stride stays within one stride
//!   - every_process_runs_in_first_round(): n runnable processes, first n picks distinct
//!   - pass_is_monotonic(): no dispatch lowers any pass

extern crate alloc;

use alloc::vec::Vec;

use super::Scheduler;
use crate::task::{ProcState, ProcessTable};
use proptest::prelude::*;

fn arb_priorities() -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(2i64..=64, 1..8)
}

fn table_with(priorities: &[i64], sched: &Scheduler) -> (ProcessTable, Vec<usize>) {
    let mut table = ProcessTable::new();
    let mut slots = Vec::new();
    for &priority in priorities {
        let slot = table.allocate().unwrap();
        let proc = table.get_mut(slot).unwrap();
        sched.set_priority(proc, priority).unwrap();
        proc.state = ProcState::Runnable;
        slots.push(slot);
    }
    (table, slots)
}

proptest! {
    #[test]
    fn pass_spread_is_bounded_by_max_stride(priorities in arb_priorities(), rounds in 1usize..400) {
        let mut sched = Scheduler::new();
        let (mut table, slots) = table_with(&priorities, &sched);
        let mut counts = alloc::vec![0u64; crate::config::NPROC];
        for _ in 0..rounds {
            let slot = sched.select(&mut table, 0).unwrap();
            counts[slot] += 1;
            sched.yield_current(&mut table);
        }

        let max_stride = slots.iter().map(|&s| table.get(s).unwrap().stride()).max().unwrap();
        let shares: Vec<u64> = slots
            .iter()
            .map(|&s| counts[s] * table.get(s).unwrap().stride())
            .collect();
        let hi = *shares.iter().max().unwrap();
        let lo = *shares.iter().min().unwrap();
        prop_assert!(hi - lo <= max_stride, "shares {:?} exceed stride {}", shares, max_stride);
        prop_assert_eq!(counts.iter().sum::<u64>(), rounds as u64);
    }

    #[test]
    fn every_process_runs_in_first_round(priorities in arb_priorities()) {
        let mut sched = Scheduler::new();
        let (mut table, slots) = table_with(&priorities, &sched);
        let mut seen = Vec::new();
        for _ in 0..slots.len() {
            let slot = sched.select(&mut table, 0).unwrap();
            prop_assert!(!seen.contains(&slot));
            seen.push(slot);
            sched.yield_current(&mut table);
        }
    }

    #[test]
    fn pass_is_monotonic(priorities in arb_priorities(), rounds in 1usize..200) {
        let mut sched = Scheduler::new();
        let (mut table, slots) = table_with(&priorities, &sched);
        let mut last: Vec<u64> = slots.iter().map(|&s| table.get(s).unwrap().pass()).collect();
        for _ in 0..rounds {
            sched.select(&mut table, 0).unwrap();
            sched.yield_current(&mut table);
            for (i, &s) in slots.iter().enumerate() {
                let pass = table.get(s).unwrap().pass();
                prop_assert!(pass >= last[i]);
                last[i] = pass;
            }
        }
    }
}
