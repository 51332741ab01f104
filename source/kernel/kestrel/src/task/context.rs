// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-to-kernel switch context.

use static_assertions::const_assert_eq;

/// Callee-saved registers preserved across `arch::riscv::switch`.
///
/// Never holds user registers; those live in the trapframe.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

const_assert_eq!(core::mem::size_of::<TaskContext>(), 14 * 8);

impl TaskContext {
    pub const fn zero() -> Self {
        Self { ra: 0, sp: 0, s: [0; 12] }
    }

    /// Context that starts executing at `entry` on the stack ending at `stack_top`.
    pub const fn goto(entry: usize, stack_top: usize) -> Self {
        Self { ra: entry, sp: stack_top, s: [0; 12] }
    }
}
