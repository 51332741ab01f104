// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

use crate::config;
use crate::timer::{self, TimeVal};

/// Free-running cycle counter plus the one-shot preemption timer.
///
/// Only `cycles` and `set_timer` touch hardware; every unit conversion is
/// provided on top of them as pure integer arithmetic.
pub trait Clock {
    /// Returns the raw cycle counter.
    fn cycles(&self) -> u64;
    /// Programs the next timer interrupt at absolute cycle `deadline`.
    fn set_timer(&self, deadline: u64);

    /// Cycles converted to kernel ticks.
    fn elapsed_ticks(&self) -> u64 {
        timer::cycles_to_ticks(self.cycles())
    }

    /// Cycles converted to milliseconds.
    fn millis(&self) -> u64 {
        timer::cycles_to_millis(self.cycles())
    }

    fn wall_clock(&self) -> TimeVal {
        timer::cycles_to_timeval(self.cycles())
    }

    /// Arms the timer one timeslice from now.
    fn set_next_trigger(&self) {
        self.set_timer(self.cycles().saturating_add(config::timeslice_cycles()));
    }
}

/// Byte-oriented console used by `read`/`write`.
pub trait Console {
    /// Writes a single byte.
    fn put_char(&mut self, byte: u8);
    /// Blocks until a byte is available and returns it.
    fn get_char(&mut self) -> u8;
}
