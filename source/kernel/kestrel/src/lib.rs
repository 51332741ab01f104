// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: KESTREL process and memory-management core for a single-hart Sv39 kernel
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + proptest per module, syscall integration tests under `tests/`
//! PUBLIC API: Kernel, ProcessTable, Scheduler, AddressSpace, SyscallTable
//! DEPENDS_ON: bitflags, spin, static_assertions, linked_list_allocator (target heap),
//!             riscv (target), sbi-rt (target)
//! INVARIANTS: Exactly one Running process; frames owned by exactly one PTE; user pointers
//!             are translated before any kernel access
//!
//! Host builds compile everything except the boot path so that the process table,
//! scheduler, address-space manager and syscall layer can be exercised by `cargo test`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;
pub use diag::log;

pub mod arch;
pub mod config;
pub mod hal;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod timer;
pub mod trap;
pub mod types;
pub mod uart;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod kmain;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod panic;

pub use kernel::Kernel;
