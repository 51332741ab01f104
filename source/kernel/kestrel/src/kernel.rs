// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Aggregated kernel state and the trap-to-scheduler glue
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: Kernel (new/launch/schedule/handle_trap/handle_syscall)
//! DEPENDS_ON: task::ProcessTable, sched::Scheduler, syscall::SyscallTable, hal, loader
//! INVARIANTS: `current` is set only while a process is Running; a process that
//!             stops running hands the hart back to the idle context
//!
//! The idle context is the boot stack's loop: [`Kernel::schedule`] switches from
//! it into the chosen process's kernel context, and a process that yields, exits,
//! sleeps in `wait` or is preempted switches back into it. On host builds
//! `arch::riscv::switch` is a no-op, so tests drive the same state machine by
//! calling `schedule` directly.

extern crate alloc;

use alloc::boxed::Box;

use crate::arch::riscv;
use crate::hal::{Clock, Console};
use crate::loader::ProgramLoader;
use crate::mm::FrameAllocator;
use crate::sched::Scheduler;
use crate::syscall::{self, api, Args, SyscallTable};
use crate::task::{Pid, ProcState, ProcessTable, TaskContext};
use crate::trap::{self, TrapCause, TrapFrame};

/// Exit code recorded for a process killed by an unhandled exception.
pub const EXCEPTION_EXIT_CODE: i32 = -1;

/// Everything the kernel owns, in one place.
pub struct Kernel {
    tasks: ProcessTable,
    scheduler: Scheduler,
    syscalls: SyscallTable,
    frames: Box<dyn FrameAllocator>,
    console: Box<dyn Console>,
    clock: Box<dyn Clock>,
    loader: Box<dyn ProgramLoader>,
    idle: TaskContext,
}

impl Kernel {
    pub fn new(
        frames: Box<dyn FrameAllocator>,
        console: Box<dyn Console>,
        clock: Box<dyn Clock>,
        loader: Box<dyn ProgramLoader>,
    ) -> Self {
        Self {
            tasks: ProcessTable::new(),
            scheduler: Scheduler::new(),
            syscalls: SyscallTable::with_default_handlers(),
            frames,
            console,
            clock,
            loader,
            idle: TaskContext::zero(),
        }
    }

    pub fn tasks(&self) -> &ProcessTable {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut ProcessTable {
        &mut self.tasks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Loads `name` and makes it a parentless runnable process.
    pub fn launch(&mut self, name: &str) -> syscall::SysResult<Pid> {
        let image = self.loader.load(name, self.frames.as_mut())?;
        let slot = self.tasks.spawn(None, image, name, self.frames.as_mut())?;
        Ok(self.tasks.get(slot).map_or(Pid::IDLE, |proc| proc.pid()))
    }

    /// One pass of the idle loop: dispatches the next runnable process and
    /// switches into it. Returns the dispatched slot, or `None` when nothing is
    /// runnable and the caller should wait for an interrupt.
    pub fn schedule(&mut self) -> Option<usize> {
        let slot = self.scheduler.select(&mut self.tasks, self.clock.cycles())?;
        let next = self.tasks.get(slot).map(|proc| &proc.context as *const TaskContext)?;
        // SAFETY: `next` points into the process table, which is not touched
        // until the switched-to process traps back into the kernel.
        unsafe { riscv::switch(&mut self.idle, next) };
        Some(slot)
    }

    // Hands the hart back to the idle context if `slot` stopped running.
    fn leave_if_stopped(&mut self, slot: usize) {
        let state = self.tasks.get(slot).map(|proc| proc.state());
        if state == Some(ProcState::Running) {
            return;
        }
        if self.tasks.current_slot() == Some(slot) {
            self.tasks.set_current(None);
        }
        let Some(context) = self.tasks.context_mut(slot) else {
            return;
        };
        let from = context as *mut TaskContext;
        // SAFETY: a slot is only reallocated from the idle context, after this
        // switch has saved into it.
        unsafe { riscv::switch(from, &self.idle) };
    }

    /// Services a trap whose registers the entry stub saved into the current
    /// process's trapframe.
    pub fn handle_trap(&mut self) {
        let Some(frame) = self.current_trapframe_mut() else {
            log_error!(target: "trap", "trap without a current process");
            return;
        };
        let (scause, stval, sepc) = (frame.scause, frame.stval, frame.sepc);
        match TrapCause::from_scause(scause) {
            TrapCause::UserEnvCall => self.handle_syscall(),
            TrapCause::SupervisorTimer => self.on_timer_interrupt(),
            TrapCause::Exception(_) => {
                log_error!(
                    target: "trap",
                    "{} sepc={:#x} stval={:#x}, killing process",
                    trap::describe_cause(scause),
                    sepc,
                    stval
                );
                if let Some(slot) = self.tasks.current_slot() {
                    self.tasks.terminate(slot, EXCEPTION_EXIT_CODE, self.frames.as_mut());
                    self.leave_if_stopped(slot);
                }
            }
            TrapCause::Interrupt(code) => {
                log_warn!(target: "trap", "unexpected interrupt code={}", code);
            }
        }
    }

    /// Preemption tick: re-arms the timer and yields the current process.
    pub fn on_timer_interrupt(&mut self) {
        self.clock.set_next_trigger();
        let Some(slot) = self.tasks.current_slot() else {
            return;
        };
        self.scheduler.yield_current(&mut self.tasks);
        self.leave_if_stopped(slot);
    }

    /// Dispatches the syscall described by the current trapframe and writes
    /// its result into `a0`.
    pub fn handle_syscall(&mut self) {
        let Some(slot) = self.tasks.current_slot() else {
            return;
        };
        let Some(frame) = self.tasks.get_mut(slot).and_then(|proc| proc.trapframe_mut()) else {
            return;
        };
        frame.advance_sepc();
        let id = frame.syscall_id();
        let args = Args::new(frame.syscall_args());

        if let Some(proc) = self.tasks.get_mut(slot) {
            if !proc.record_syscall(id) {
                log_error!(target: "syscall", "pid={} syscall id {} out of range", proc.pid(), id);
            }
        }
        #[cfg(feature = "trace_syscalls")]
        log_trace!(target: "syscall", "syscall {} args = {:x?}", id, args);

        let result = {
            let mut ctx = api::Context::new(
                &mut self.tasks,
                &mut self.scheduler,
                self.frames.as_mut(),
                self.console.as_mut(),
                self.loader.as_ref(),
                self.clock.as_ref(),
            );
            self.syscalls.dispatch(id, &mut ctx, &args)
        };

        let ret = match result {
            Ok(value) => Some(value),
            Err(syscall::Error::InvalidSyscall) => {
                log_error!(target: "syscall", "unknown syscall {}", id);
                Some(usize::MAX)
            }
            Err(err) if err.writes_result() => {
                log_debug!(target: "syscall", "syscall {} failed: {}", id, err);
                Some(usize::MAX)
            }
            Err(_) => None,
        };
        if let Some(ret) = ret {
            #[cfg(feature = "trace_syscalls")]
            log_trace!(target: "syscall", "syscall {} ret {}", id, ret as isize);
            // `exec` may have installed a fresh frame; the result lands in whichever is live.
            if let Some(frame) = self.tasks.get_mut(slot).and_then(|proc| proc.trapframe_mut()) {
                frame.set_a0(ret);
            }
        }
        self.leave_if_stopped(slot);
    }

    /// Trapframe of the running process.
    pub fn current_trapframe_mut(&mut self) -> Option<&mut TrapFrame> {
        self.tasks.current_mut().ok()?.trapframe_mut()
    }

    /// `satp` value for the running process's address space.
    pub fn current_satp(&self) -> Option<usize> {
        self.tasks.current().ok()?.address_space().map(|space| space.satp())
    }

    /// Number of processes that are neither free nor zombies.
    pub fn live_processes(&self) -> usize {
        self.tasks.iter().filter(|(_, proc)| proc.state() != ProcState::Zombie).count()
    }
}
