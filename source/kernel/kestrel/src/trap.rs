// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap handling: register-set contract with the external entry/exit stub,
//! trap classification, and the Rust handler the stub calls into.
//!
//! The stub saves every user register into the current process's
//! [`TrapFrame`] (located through `sscratch`), switches to the kernel stack and
//! calls `__trap_rust`. Returning to user mode goes through
//! `__return_to_user(frame, satp)`, which restores exactly what the kernel left
//! in the frame.

use core::fmt::{self, Write};
use core::ptr::NonNull;
use spin::Mutex;

use crate::kernel::Kernel;

/// `sstatus.SPIE`: interrupts re-enabled after `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// `sstatus.SPP`: previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);
const S_TIMER_INT: usize = 5;
const ECALL_UMODE: usize = 8;

const REG_SP: usize = 2;
const REG_A0: usize = 10;
const REG_A7: usize = 17;

/// Saved user register state.
/// Must match the stub's save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);

impl TrapFrame {
    /// Frame that enters user mode at `entry` with stack pointer `sp`.
    pub fn user_entry(entry: usize, sp: usize) -> Self {
        let mut frame = Self { sepc: entry, sstatus: SSTATUS_SPIE, ..Self::default() };
        frame.x[REG_SP] = sp;
        frame
    }

    /// Syscall number (`a7`).
    #[inline]
    pub fn syscall_id(&self) -> usize {
        self.x[REG_A7]
    }

    /// Syscall arguments (`a0..a5`).
    #[inline]
    pub fn syscall_args(&self) -> [usize; 6] {
        let mut args = [0; 6];
        args.copy_from_slice(&self.x[REG_A0..REG_A0 + 6]);
        args
    }

    #[inline]
    pub fn a0(&self) -> usize {
        self.x[REG_A0]
    }

    #[inline]
    pub fn set_a0(&mut self, value: usize) {
        self.x[REG_A0] = value;
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.x[REG_SP]
    }

    /// Steps over the 4-byte `ecall` so `sret` resumes after it.
    #[inline]
    pub fn advance_sepc(&mut self) {
        self.sepc = self.sepc.wrapping_add(4);
    }
}

/// What caused a trap, as far as the kernel core cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    UserEnvCall,
    SupervisorTimer,
    Exception(usize),
    Interrupt(usize),
}

impl TrapCause {
    pub fn from_scause(scause: usize) -> Self {
        let code = scause & !INTERRUPT_FLAG;
        match (is_interrupt(scause), code) {
            (true, S_TIMER_INT) => Self::SupervisorTimer,
            (true, code) => Self::Interrupt(code),
            (false, ECALL_UMODE) => Self::UserEnvCall,
            (false, code) => Self::Exception(code),
        }
    }
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

// ——— kernel registration for the trap entry ———

static KERNEL: Mutex<Option<usize>> = Mutex::new(None);

/// Registers the kernel instance the trap entry dispatches into.
///
/// # Safety
/// `kernel` must stay valid and must not move for the rest of execution, and
/// the kernel must run on a single hart with no other references to it in use.
///
/// The idle loop borrows the kernel through [`with_kernel`] and keeps that
/// borrow parked inside `arch::riscv::switch` while a process runs. Traps from
/// that process re-enter through [`registered_kernel`] and take short-lived
/// borrows of their own. The parked borrow is not touched again until the
/// process switches back to idle, so at most one borrow is ever active. Callers
/// must not use a kernel reference across any path that returns to user mode.
pub unsafe fn register_kernel(kernel: *mut Kernel) {
    *KERNEL.lock() = Some(kernel as usize);
}

/// Address of the registered kernel, without borrowing it.
///
/// The registration lock is released before returning.
pub fn registered_kernel() -> Option<NonNull<Kernel>> {
    let addr = (*KERNEL.lock())?;
    NonNull::new(addr as *mut Kernel)
}

/// Runs `f` against the registered kernel, if any.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    let mut kernel = registered_kernel()?;
    // SAFETY: `register_kernel` keeps the pointer valid; the single-hart contract
    // documented there rules out a second active borrow.
    Some(f(unsafe { kernel.as_mut() }))
}

// ——— stub entry points (OS target only) ———

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn __trap_vector();
    fn __return_to_user(frame: *mut TrapFrame, satp: usize) -> !;
}

/// Installs the stub's trap vector; call once during early boot.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn install_trap_vector() {
    crate::arch::riscv::configure_traps(__trap_vector as usize);
}

/// Resumes the current process in user mode.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn return_to_user() -> ! {
    let target = registered_kernel().and_then(|mut kernel| {
        // SAFETY: see `register_kernel`; the borrow ends before `sret`.
        let kernel = unsafe { kernel.as_mut() };
        let satp = kernel.current_satp();
        kernel.current_trapframe_mut().map(|frame| (frame as *mut TrapFrame, satp))
    });
    match target {
        Some((frame, Some(satp))) => {
            // munmap/sbrk may have dropped pages of the space being resumed.
            crate::arch::riscv::flush_tlb();
            // SAFETY: sscratch tells the stub where to save the next trap's registers.
            unsafe {
                riscv::register::sscratch::write(frame as usize);
                __return_to_user(frame, satp)
            }
        }
        _ => panic!("return_to_user without a current process"),
    }
}

/// First kernel-side code a newly scheduled process runs: straight to user mode.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" fn first_entry() -> ! {
    return_to_user()
}

/// Address stored in a fresh process context's `ra`.
pub fn first_entry_address() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        first_entry as usize
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn __trap_rust() -> ! {
    if let Some(mut kernel) = registered_kernel() {
        // SAFETY: see `register_kernel`; any idle-loop borrow is parked in `switch`.
        unsafe { kernel.as_mut() }.handle_trap();
    }
    return_to_user()
}

#[cfg(test)]
mod tests {
    extern crate alloc;
    use super::*;
    use alloc::string::String;

    #[test]
    fn classifies_user_ecall_and_timer() {
        assert_eq!(TrapCause::from_scause(8), TrapCause::UserEnvCall);
        assert_eq!(TrapCause::from_scause(INTERRUPT_FLAG | 5), TrapCause::SupervisorTimer);
        assert_eq!(TrapCause::from_scause(13), TrapCause::Exception(13));
        assert_eq!(TrapCause::from_scause(INTERRUPT_FLAG | 9), TrapCause::Interrupt(9));
    }

    #[test]
    fn syscall_registers_follow_abi() {
        let mut frame = TrapFrame::default();
        frame.x[17] = 64;
        frame.x[10..16].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(frame.syscall_id(), 64);
        assert_eq!(frame.syscall_args(), [1, 2, 3, 4, 5, 6]);
        frame.set_a0(7);
        assert_eq!(frame.a0(), 7);
    }

    #[test]
    fn user_entry_frame_returns_to_user_mode() {
        let frame = TrapFrame::user_entry(0x1000, 0x4000);
        assert_eq!(frame.sepc, 0x1000);
        assert_eq!(frame.sp(), 0x4000);
        assert_eq!(frame.sstatus & SSTATUS_SPP, 0);
        assert_ne!(frame.sstatus & SSTATUS_SPIE, 0);
    }

    #[test]
    fn fmt_includes_registers() {
        let mut frame = TrapFrame::default();
        frame.x[10..=17].copy_from_slice(&[1; 8]);
        frame.sepc = 0x2000;
        frame.scause = 9;
        frame.stval = 0x3000;
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("sepc"));
        assert!(out.contains("EnvironmentCallFromSMode"));
        assert!(out.contains("a0..a7"));
    }

    struct NullClock;

    impl crate::hal::Clock for NullClock {
        fn cycles(&self) -> u64 {
            0
        }
        fn set_timer(&self, _deadline: u64) {}
    }

    struct NullConsole;

    impl crate::hal::Console for NullConsole {
        fn put_char(&mut self, _byte: u8) {}
        fn get_char(&mut self) -> u8 {
            0
        }
    }

    #[test]
    fn registration_lock_is_free_while_the_kernel_is_borrowed() {
        use alloc::boxed::Box;

        assert!(with_kernel(|kernel| kernel.live_processes()).is_none());
        let kernel = Box::leak(Box::new(Kernel::new(
            Box::new(crate::mm::FramePool::heap(1)),
            Box::new(NullConsole),
            Box::new(NullClock),
            Box::new(crate::loader::AppLoader::new()),
        )));
        let expected = kernel as *mut Kernel;
        // SAFETY: leaked, so it never moves; nothing else borrows it.
        unsafe { register_kernel(expected) };
        let seen = with_kernel(|kernel| {
            // A re-entrant trap path looks the kernel up while this borrow is live.
            (kernel.live_processes(), registered_kernel().map(NonNull::as_ptr))
        });
        assert_eq!(seen, Some((0, Some(expected))));
    }
}
