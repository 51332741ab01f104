// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs
//! DEPENDS_ON: loader, mm, sched, task, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL_NUM window; stable Linux-compatible IDs; every
//!             failure surfaces as -1 in a0, never as a kernel fault

pub mod api;

use core::fmt;

use crate::config::MAX_SYSCALL_NUM;
use crate::{loader, mm, sched, task};

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

pub const SYSCALL_READ: usize = 63;
pub const SYSCALL_WRITE: usize = 64;
pub const SYSCALL_EXIT: usize = 93;
pub const SYSCALL_YIELD: usize = 124;
pub const SYSCALL_SET_PRIORITY: usize = 140;
pub const SYSCALL_GETTIMEOFDAY: usize = 169;
pub const SYSCALL_GETPID: usize = 172;
pub const SYSCALL_GETPPID: usize = 173;
pub const SYSCALL_SBRK: usize = 214;
pub const SYSCALL_MUNMAP: usize = 215;
/// `fork`: the child resumes with `a0 == 0`.
pub const SYSCALL_CLONE: usize = 220;
pub const SYSCALL_EXEC: usize = 221;
pub const SYSCALL_MMAP: usize = 222;
pub const SYSCALL_WAIT: usize = 260;
/// Starts a named program as a child without copying the caller.
pub const SYSCALL_SPAWN: usize = 400;
pub const SYSCALL_TASK_INFO: usize = 410;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Bad file descriptor, priority, string or argument combination.
    InvalidArgument,
    /// Address-space operation or user copy failed.
    Vm(mm::VmError),
    /// Process lifecycle operation failed.
    Proc(task::ProcError),
    /// Program lookup or image construction failed.
    Load(loader::LoadError),
    /// Current process terminated and must not resume.
    TaskExit,
    /// Current process sleeps in `wait`; its result is delivered on wake-up.
    Suspended,
}

impl Error {
    /// Whether the dispatcher still owes the caller an `a0` value.
    pub fn writes_result(self) -> bool {
        !matches!(self, Self::TaskExit | Self::Suspended)
    }
}

impl From<mm::VmError> for Error {
    fn from(value: mm::VmError) -> Self {
        Self::Vm(value)
    }
}

impl From<task::ProcError> for Error {
    fn from(value: task::ProcError) -> Self {
        Self::Proc(value)
    }
}

impl From<loader::LoadError> for Error {
    fn from(value: loader::LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<sched::SchedError> for Error {
    fn from(value: sched::SchedError) -> Self {
        match value {
            sched::SchedError::InvalidArgument => Self::InvalidArgument,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL_NUM],
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL_NUM] }
    }

    /// Creates a table with every kestrel syscall installed.
    pub fn with_default_handlers() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    /// Registers a handler; numbers outside the table are ignored.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL_NUM {
            self.handlers[number] = Some(handler);
        }
    }

    pub fn is_registered(&self, number: usize) -> bool {
        matches!(self.handlers.get(number), Some(Some(_)))
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}
