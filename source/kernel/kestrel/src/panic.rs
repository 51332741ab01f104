// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel panic handler emitting diagnostics over UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::with_kernel(), uart::raw_writer()
//! INVARIANTS: Lock-free output; never returns

use core::{fmt::Write, panic::PanicInfo};

use crate::{trap, uart};

/// Emits the panic message, its location and the current process's trapframe.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();

    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    let _ = writeln!(w, "{}", info.message());

    // The kernel may be mid-update; only read what the trapframe holds.
    let frame = trap::with_kernel(|kernel| kernel.current_trapframe_mut().map(|f| *f)).flatten();
    if let Some(frame) = frame {
        let _ = w.write_str("PANIC: current trap:\n");
        let _ = trap::fmt_trap(&frame, &mut w);
    }

    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}
