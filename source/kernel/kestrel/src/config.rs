// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-wide constants and boot knobs
//! OWNERS: @kernel-team
//! PUBLIC API: NPROC, MAX_SYSCALL_NUM, BIG_STRIDE, CPU_FREQ, ..., timeslice_cycles()
//! DEPENDS_ON: core::sync::atomic
//! INVARIANTS: Relaxed atomics sufficient (single hart); constants are part of the user ABI
//!
//! Values that user binaries observe (syscall table width, string staging size,
//! load address) must stay in sync with the user library.

use core::sync::atomic::{AtomicU64, Ordering};

/// Capacity of the process table.
pub const NPROC: usize = 16;

/// Width of the per-process syscall counter array reported by `task_info`.
pub const MAX_SYSCALL_NUM: usize = 500;

/// Numerator of the stride computation (`stride = BIG_STRIDE / priority`).
pub const BIG_STRIDE: u64 = 65_536;

/// Priority assigned to freshly allocated processes.
pub const DEFAULT_PRIORITY: u64 = 16;

/// Frequency of the `time` CSR on QEMU `virt`.
pub const CPU_FREQ: u64 = 12_500_000;

/// Preemption ticks per second.
pub const TICKS_PER_SEC: u64 = 100;

/// Kernel staging buffer for console I/O and path names.
pub const MAX_STR_LEN: usize = 200;

/// Pid reported for the idle/reaper context.
pub const IDLE_PID: u32 = 0;

/// Virtual address at which flat user images are loaded.
pub const BASE_ADDRESS: usize = 0x1000;

/// Bytes of user stack mapped above every loaded image.
pub const USER_STACK_SIZE: usize = 4096;

/// Bytes of kernel stack reserved per process slot.
pub const KERNEL_STACK_SIZE: usize = 4096 * 2;

/// Kernel heap backing PCBs, page-table nodes and staging buffers.
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;

/// End of physical RAM on a 128 MiB QEMU `virt` machine.
pub const MEMORY_END: usize = 0x8800_0000;

const DEFAULT_TIMESLICE_CYCLES: u64 = CPU_FREQ / TICKS_PER_SEC;

static TIMESLICE_CYCLES: AtomicU64 = AtomicU64::new(DEFAULT_TIMESLICE_CYCLES);

/// Returns the preemption quantum in timer cycles.
#[inline]
pub fn timeslice_cycles() -> u64 {
    TIMESLICE_CYCLES.load(Ordering::Relaxed)
}

/// Overrides the preemption quantum in timer cycles.
///
/// Zero is clamped to one cycle so the timer is always re-armed in the future.
#[inline]
pub fn set_timeslice_cycles(value: u64) {
    TIMESLICE_CYCLES.store(value.max(1), Ordering::Relaxed);
}
