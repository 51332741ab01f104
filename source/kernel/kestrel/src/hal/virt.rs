// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use crate::arch::riscv;

use super::Clock;

/// Clock backed by the `time` CSR, with deadlines programmed through SBI.
pub struct VirtClock;

impl VirtClock {
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for VirtClock {
    fn cycles(&self) -> u64 {
        riscv::read_time()
    }

    fn set_timer(&self, deadline: u64) {
        riscv::set_timer(deadline);
    }
}
