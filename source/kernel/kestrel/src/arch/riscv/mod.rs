// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used across the kestrel kernel.
//!
//! Host builds keep the high level logic testable through the
//! `#[cfg(not(target_arch = "riscv64"))]` stubs: CSR reads return zero and the
//! context switch degenerates to a no-op.

use crate::task::TaskContext;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    ".section .text",
    ".globl __switch",
    "__switch:",
    "    sd ra, 0(a0)",
    "    sd sp, 8(a0)",
    "    sd s0, 16(a0)",
    "    sd s1, 24(a0)",
    "    sd s2, 32(a0)",
    "    sd s3, 40(a0)",
    "    sd s4, 48(a0)",
    "    sd s5, 56(a0)",
    "    sd s6, 64(a0)",
    "    sd s7, 72(a0)",
    "    sd s8, 80(a0)",
    "    sd s9, 88(a0)",
    "    sd s10, 96(a0)",
    "    sd s11, 104(a0)",
    "    ld ra, 0(a1)",
    "    ld sp, 8(a1)",
    "    ld s0, 16(a1)",
    "    ld s1, 24(a1)",
    "    ld s2, 32(a1)",
    "    ld s3, 40(a1)",
    "    ld s4, 48(a1)",
    "    ld s5, 56(a1)",
    "    ld s6, 64(a1)",
    "    ld s7, 72(a1)",
    "    ld s8, 80(a1)",
    "    ld s9, 88(a1)",
    "    ld s10, 96(a1)",
    "    ld s11, 104(a1)",
    "    ret",
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __switch(old: *mut TaskContext, new: *const TaskContext);
}

/// Saves the callee-saved bank into `old` and resumes `new`.
///
/// # Safety
/// `new` must hold a context primed by the kernel (valid `ra` and `sp` on a live
/// kernel stack). Only kernel registers cross this boundary.
#[inline]
pub unsafe fn switch(old: *mut TaskContext, new: *const TaskContext) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        __switch(old, new);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (old, new);
    }
}

/// Installs the trap vector address for supervisor mode.
#[inline]
pub fn configure_traps(trap_vector: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: called once during boot before interrupts are enabled.
    unsafe {
        riscv::register::stvec::write(trap_vector, riscv::register::mtvec::TrapMode::Direct);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = trap_vector;
    }
}

/// Enables supervisor timer interrupts.
#[inline]
pub fn enable_timer_interrupts() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: the trap vector is installed before the first timer is armed.
    unsafe {
        riscv::register::sie::set_stimer();
    }
}

/// Reads the `time` CSR.
#[inline]
pub fn read_time() -> u64 {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::time::read64()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Programs the supervisor timer through SBI.
#[inline]
pub fn set_timer(deadline: u64) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let _ = sbi_rt::set_timer(deadline);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = deadline;
    }
}

/// Flushes the whole TLB after a page-table change.
#[inline]
pub fn flush_tlb() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: sfence.vma only orders translation caches.
    unsafe {
        core::arch::asm!("sfence.vma x0, x0", options(nostack));
    }
}

/// Issues a WFI instruction or yields on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: wfi has no architectural side effects beyond stalling the hart.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        core::hint::spin_loop();
    }
}
