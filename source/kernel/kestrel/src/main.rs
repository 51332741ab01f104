// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot wrapper for the KESTREL kernel. Provides the `_start` entry point that
//! sets up the boot stack, clears `.bss` and jumps into `kestrel`'s `kmain`.
#![cfg_attr(all(target_arch = "riscv64", target_os = "none"), no_std, no_main)]

use kestrel as _;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text._start, "ax", @progbits
    .globl _start
    .align 4
_start:
    la   sp, __stack_top
    .option push
    .option norelax
    la   gp, __global_pointer$
    .option pop
    la   t0, __bss_start
    la   t1, __bss_end
1:
    bgeu t0, t1, 2f
    sd   zero, 0(t0)
    addi t0, t0, 8
    j    1b
2:
    j    kmain
"#
);

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn main() {}
