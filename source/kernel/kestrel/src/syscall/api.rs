// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context, TaskInfo, TaskStatus
//! DEPENDS_ON: sched::Scheduler, task::ProcessTable, mm::AddressSpace, loader::ProgramLoader,
//!             hal::{Clock, Console}
//! INVARIANTS: Every user pointer is decoded as a canonical VirtAddr and then goes through
//!             the caller's AddressSpace copy helpers; staging buffers are bounded by MAX_STR_LEN

extern crate alloc;

use alloc::vec;
use core::cmp;

use static_assertions::const_assert_eq;

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CLONE, SYSCALL_EXEC, SYSCALL_EXIT,
    SYSCALL_GETPID, SYSCALL_GETPPID, SYSCALL_GETTIMEOFDAY, SYSCALL_MMAP, SYSCALL_MUNMAP,
    SYSCALL_READ, SYSCALL_SBRK, SYSCALL_SET_PRIORITY, SYSCALL_SPAWN, SYSCALL_TASK_INFO,
    SYSCALL_WAIT, SYSCALL_WRITE, SYSCALL_YIELD,
};
use crate::config::{MAX_STR_LEN, MAX_SYSCALL_NUM};
use crate::hal::{Clock, Console};
use crate::loader::ProgramLoader;
use crate::mm::{AddressSpace, FrameAllocator};
use crate::sched::Scheduler;
use crate::task::{Pid, ProcError, ProcessTable, WaitOutcome};
use crate::timer;
use crate::types::VirtAddr;

pub const STDIN: usize = 0;
pub const STDOUT: usize = 1;

/// Execution context shared across syscalls.
pub struct Context<'a> {
    pub tasks: &'a mut ProcessTable,
    pub scheduler: &'a mut Scheduler,
    pub frames: &'a mut dyn FrameAllocator,
    pub console: &'a mut dyn Console,
    pub loader: &'a dyn ProgramLoader,
    pub clock: &'a dyn Clock,
}

impl<'a> Context<'a> {
    /// Creates a new context for the current process.
    pub fn new(
        tasks: &'a mut ProcessTable,
        scheduler: &'a mut Scheduler,
        frames: &'a mut dyn FrameAllocator,
        console: &'a mut dyn Console,
        loader: &'a dyn ProgramLoader,
        clock: &'a dyn Clock,
    ) -> Self {
        Self { tasks, scheduler, frames, console, loader, clock }
    }

    fn current_slot(&self) -> SysResult<usize> {
        self.tasks.current_slot().ok_or(Error::Proc(ProcError::NoCurrent))
    }

    fn current_space(&mut self) -> SysResult<&mut AddressSpace> {
        self.space_and_frames().map(|(space, _)| space)
    }

    // Split borrow for handlers that map or unmap pages.
    fn space_and_frames(&mut self) -> SysResult<(&mut AddressSpace, &mut dyn FrameAllocator)> {
        let space = self
            .tasks
            .current_mut()?
            .address_space_mut()
            .ok_or(Error::Proc(ProcError::NoCurrent))?;
        Ok((space, &mut *self.frames))
    }

    // Reads a NUL-terminated program name of at most MAX_STR_LEN bytes.
    fn program_name(&mut self, va: VirtAddr) -> SysResult<alloc::string::String> {
        let raw = self.current_space()?.copy_in_str(va.raw(), MAX_STR_LEN)?;
        alloc::string::String::from_utf8(raw).map_err(|_| Error::InvalidArgument)
    }
}

/// Process status reported by `task_info`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    UnInit = 0,
    Ready = 1,
    Running = 2,
    Exited = 3,
}

/// Snapshot written to user memory by `task_info`.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// Milliseconds since the caller was first dispatched.
    pub time: i32,
}

const_assert_eq!(core::mem::size_of::<TaskInfo>(), 2008);

impl TaskInfo {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Little-endian image of the structure as user space lays it out.
    pub fn to_bytes(&self) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&(self.status as u32).to_le_bytes());
        for count in &self.syscall_times {
            out.extend_from_slice(&count.to_le_bytes());
        }
        out.extend_from_slice(&self.time.to_le_bytes());
        out
    }
}

#[inline]
fn user_ptr(raw: usize) -> SysResult<VirtAddr> {
    VirtAddr::new(raw).ok_or(Error::InvalidArgument)
}

/// Typed view of the `mmap`/`munmap` argument registers.
#[derive(Copy, Clone)]
struct RegionArgsTyped {
    start: VirtAddr,
    len: usize,
    prot: usize,
}

impl RegionArgsTyped {
    fn decode(args: &Args) -> SysResult<Self> {
        let start = VirtAddr::page_aligned(args.get(0)).ok_or(Error::InvalidArgument)?;
        Ok(Self { start, len: args.get(1), prot: args.get(2) })
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_READ, sys_read);
    table.register(SYSCALL_WRITE, sys_write);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_YIELD, sys_yield);
    table.register(SYSCALL_SET_PRIORITY, sys_set_priority);
    table.register(SYSCALL_GETTIMEOFDAY, sys_gettimeofday);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_GETPPID, sys_getppid);
    table.register(SYSCALL_SBRK, sys_sbrk);
    table.register(SYSCALL_MUNMAP, sys_munmap);
    table.register(SYSCALL_CLONE, sys_clone);
    table.register(SYSCALL_EXEC, sys_exec);
    table.register(SYSCALL_MMAP, sys_mmap);
    table.register(SYSCALL_WAIT, sys_wait);
    table.register(SYSCALL_SPAWN, sys_spawn);
    table.register(SYSCALL_TASK_INFO, sys_task_info);
}

fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    if args.get(0) != STDOUT {
        return Err(Error::InvalidArgument);
    }
    let buf = user_ptr(args.get(1))?;
    let mut staging = vec![0u8; cmp::min(args.get(2), MAX_STR_LEN)];
    ctx.current_space()?.copy_in(buf.raw(), &mut staging)?;
    for &byte in &staging {
        ctx.console.put_char(byte);
    }
    Ok(staging.len())
}

fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    if args.get(0) != STDIN {
        return Err(Error::InvalidArgument);
    }
    let buf = user_ptr(args.get(1))?;
    let len = cmp::min(args.get(2), MAX_STR_LEN);
    let staging: alloc::vec::Vec<u8> = (0..len).map(|_| ctx.console.get_char()).collect();
    ctx.current_space()?.copy_out(buf.raw(), &staging)?;
    Ok(len)
}

fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let code = args.get(0) as i32;
    let slot = ctx.current_slot()?;
    ctx.tasks.terminate(slot, code, ctx.frames);
    Err(Error::TaskExit)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.scheduler.yield_current(ctx.tasks);
    Ok(0)
}

fn sys_set_priority(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let proc = ctx.tasks.current_mut()?;
    let priority = ctx.scheduler.set_priority(proc, args.get(0) as i64)?;
    Ok(priority as usize)
}

fn sys_gettimeofday(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let out = user_ptr(args.get(0))?;
    let now = ctx.clock.wall_clock();
    ctx.current_space()?.copy_out(out.raw(), &now.to_bytes())?;
    Ok(0)
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.tasks.current()?.pid().as_raw() as usize)
}

fn sys_getppid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let slot = ctx.current_slot()?;
    Ok(ctx.tasks.parent_pid(slot).as_raw() as usize)
}

fn sys_clone(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let slot = ctx.current_slot()?;
    let child = ctx.tasks.fork(slot, ctx.frames)?;
    let pid = ctx.tasks.get(child).map(|proc| proc.pid()).unwrap_or(Pid::IDLE);
    Ok(pid.as_raw() as usize)
}

fn sys_exec(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let name = ctx.program_name(user_ptr(args.get(0))?)?;
    let slot = ctx.current_slot()?;
    // Loading first leaves the caller untouched when the program is missing.
    let image = ctx.loader.load(&name, ctx.frames)?;
    ctx.tasks.exec(slot, image, &name, ctx.frames)?;
    Ok(0)
}

fn sys_wait(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let raw = args.get(0) as isize;
    let filter = if raw <= 0 { None } else { Some(Pid::from_raw(raw as u32)) };
    let code_ptr = user_ptr(args.get(1))?;
    let slot = ctx.current_slot()?;
    match ctx.tasks.reap(slot, filter, code_ptr.raw())? {
        WaitOutcome::Reaped(pid) => Ok(pid.as_raw() as usize),
        WaitOutcome::Suspended => Err(Error::Suspended),
    }
}

fn sys_spawn(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let name = ctx.program_name(user_ptr(args.get(0))?)?;
    let slot = ctx.current_slot()?;
    let image = ctx.loader.load(&name, ctx.frames)?;
    let child = ctx.tasks.spawn(Some(slot), image, &name, ctx.frames)?;
    let pid = ctx.tasks.get(child).map(|proc| proc.pid()).unwrap_or(Pid::IDLE);
    Ok(pid.as_raw() as usize)
}

fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (space, frames) = ctx.space_and_frames()?;
    Ok(space.grow_break(args.get(0) as isize, frames)?)
}

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    // flags (a3) and fd (a4) are accepted but file-backed mappings do not exist.
    let region = RegionArgsTyped::decode(args)?;
    let (space, frames) = ctx.space_and_frames()?;
    space.map_region(region.start.raw(), region.len, region.prot, frames)?;
    log_debug!(target: "syscall", "mmap {:#x} len={:#x} prot={:#x}", region.start, region.len, region.prot);
    Ok(0)
}

fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let region = RegionArgsTyped::decode(args)?;
    let (space, frames) = ctx.space_and_frames()?;
    space.unmap_region(region.start.raw(), region.len, frames)?;
    Ok(0)
}

fn sys_task_info(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let out = user_ptr(args.get(0))?;
    let now = ctx.clock.cycles();
    let proc = ctx.tasks.current()?;
    let elapsed = now.saturating_sub(proc.start_time().unwrap_or(now));
    let info = TaskInfo {
        status: TaskStatus::Running,
        syscall_times: *proc.syscall_times(),
        time: cmp::min(timer::cycles_to_millis(elapsed), i32::MAX as u64) as i32,
    };
    ctx.current_space()?.copy_out(out.raw(), &info.to_bytes())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CPU_FREQ;
    use crate::loader::{AppLoader, LoadedImage};
    use crate::mm::{FramePool, VmError, PAGE_SIZE};
    use alloc::vec::Vec;
    use core::cell::Cell;

    const BUF: usize = 0x1000;

    struct TestClock(Cell<u64>);

    impl Clock for TestClock {
        fn cycles(&self) -> u64 {
            self.0.get()
        }
        fn set_timer(&self, _deadline: u64) {}
    }

    #[derive(Default)]
    struct TestConsole {
        out: Vec<u8>,
        input: Vec<u8>,
    }

    impl Console for TestConsole {
        fn put_char(&mut self, byte: u8) {
            self.out.push(byte);
        }
        fn get_char(&mut self) -> u8 {
            if self.input.is_empty() {
                0
            } else {
                self.input.remove(0)
            }
        }
    }

    struct Harness {
        tasks: ProcessTable,
        scheduler: Scheduler,
        frames: FramePool,
        console: TestConsole,
        loader: AppLoader,
        clock: TestClock,
        table: SyscallTable,
    }

    impl Harness {
        fn new() -> Self {
            let mut frames = FramePool::heap(64);
            let mut tasks = ProcessTable::new();
            let mut scheduler = Scheduler::new();
            let mut space = AddressSpace::new();
            space.map_region(BUF, 2 * PAGE_SIZE, 0b011, &mut frames).unwrap();
            space.init_heap(BUF + 2 * PAGE_SIZE);
            let image = LoadedImage { space, entry: BUF, user_sp: BUF + 2 * PAGE_SIZE };
            tasks.spawn(None, image, "init", &mut frames).unwrap();
            scheduler.select(&mut tasks, 0).unwrap();
            Self {
                tasks,
                scheduler,
                frames,
                console: TestConsole::default(),
                loader: AppLoader::new(),
                clock: TestClock(Cell::new(0)),
                table: SyscallTable::with_default_handlers(),
            }
        }

        fn call(&mut self, id: usize, regs: [usize; 6]) -> SysResult<usize> {
            let mut ctx = Context::new(
                &mut self.tasks,
                &mut self.scheduler,
                &mut self.frames,
                &mut self.console,
                &self.loader,
                &self.clock,
            );
            self.table.dispatch(id, &mut ctx, &Args::new(regs))
        }

        fn space(&mut self) -> &mut AddressSpace {
            self.tasks.current_mut().unwrap().address_space_mut().unwrap()
        }
    }

    #[test]
    fn unknown_id_is_invalid_syscall() {
        let mut h = Harness::new();
        assert_eq!(h.call(7, [0; 6]), Err(Error::InvalidSyscall));
        assert_eq!(h.call(MAX_SYSCALL_NUM + 3, [0; 6]), Err(Error::InvalidSyscall));
    }

    #[test]
    fn write_copies_clamped_bytes_to_console() {
        let mut h = Harness::new();
        let payload = [b'x'; 300];
        h.space().copy_out(BUF, &payload).unwrap();
        assert_eq!(h.call(SYSCALL_WRITE, [STDOUT, BUF, 300, 0, 0, 0]), Ok(MAX_STR_LEN));
        assert_eq!(h.console.out.len(), MAX_STR_LEN);
        assert_eq!(h.call(SYSCALL_WRITE, [2, BUF, 1, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(
            h.call(SYSCALL_WRITE, [STDOUT, 0x40_0000, 4, 0, 0, 0]),
            Err(Error::Vm(VmError::Fault))
        );
    }

    #[test]
    fn read_fills_user_buffer() {
        let mut h = Harness::new();
        h.console.input = b"hey".to_vec();
        assert_eq!(h.call(SYSCALL_READ, [STDIN, BUF, 3, 0, 0, 0]), Ok(3));
        let mut got = [0u8; 3];
        h.space().copy_in(BUF, &mut got).unwrap();
        assert_eq!(&got, b"hey");
        assert_eq!(h.call(SYSCALL_READ, [STDOUT, BUF, 3, 0, 0, 0]), Err(Error::InvalidArgument));
    }

    #[test]
    fn gettimeofday_writes_timeval() {
        let mut h = Harness::new();
        h.clock.0.set(2 * CPU_FREQ + CPU_FREQ / 4);
        assert_eq!(h.call(SYSCALL_GETTIMEOFDAY, [BUF, 0, 0, 0, 0, 0]), Ok(0));
        let mut raw = [0u8; 16];
        h.space().copy_in(BUF, &mut raw).unwrap();
        assert_eq!(u64::from_le_bytes(raw[..8].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(raw[8..].try_into().unwrap()), 250_000);
    }

    #[test]
    fn pid_queries() {
        let mut h = Harness::new();
        assert_eq!(h.call(SYSCALL_GETPID, [0; 6]), Ok(1));
        assert_eq!(h.call(SYSCALL_GETPPID, [0; 6]), Ok(0));
    }

    #[test]
    fn sbrk_returns_previous_break() {
        let mut h = Harness::new();
        let base = BUF + 2 * PAGE_SIZE;
        assert_eq!(h.call(SYSCALL_SBRK, [PAGE_SIZE, 0, 0, 0, 0, 0]), Ok(base));
        assert_eq!(h.call(SYSCALL_SBRK, [0; 6]), Ok(base + PAGE_SIZE));
        let shrink = (-(2 * PAGE_SIZE as isize)) as usize;
        assert_eq!(
            h.call(SYSCALL_SBRK, [shrink, 0, 0, 0, 0, 0]),
            Err(Error::Vm(VmError::InvalidArgument))
        );
    }

    #[test]
    fn mmap_and_munmap_follow_region_rules() {
        let mut h = Harness::new();
        let start = 0x10_0000;
        assert_eq!(h.call(SYSCALL_MMAP, [start, PAGE_SIZE, 0b011, 0, 0, 0]), Ok(0));
        assert_eq!(
            h.call(SYSCALL_MMAP, [start, PAGE_SIZE, 0b011, 0, 0, 0]),
            Err(Error::Vm(VmError::AlreadyMapped))
        );
        assert_eq!(
            h.call(SYSCALL_MMAP, [start + 8, PAGE_SIZE, 0b001, 0, 0, 0]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            h.call(SYSCALL_MMAP, [start + PAGE_SIZE, PAGE_SIZE, 0b1000, 0, 0, 0]),
            Err(Error::Vm(VmError::InvalidArgument))
        );
        assert_eq!(h.call(SYSCALL_MUNMAP, [start, PAGE_SIZE, 0, 0, 0, 0]), Ok(0));
        assert_eq!(
            h.call(SYSCALL_MUNMAP, [start, PAGE_SIZE, 0, 0, 0, 0]),
            Err(Error::Vm(VmError::Unmapped))
        );
    }

    #[test]
    fn non_canonical_user_pointers_are_rejected_before_translation() {
        let mut h = Harness::new();
        let hole = 1usize << 40;
        let before = h.frames.in_use();
        assert_eq!(h.call(SYSCALL_WRITE, [STDOUT, hole, 4, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.call(SYSCALL_READ, [STDIN, hole, 4, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.call(SYSCALL_GETTIMEOFDAY, [hole, 0, 0, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.call(SYSCALL_TASK_INFO, [hole, 0, 0, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.call(SYSCALL_SPAWN, [hole, 0, 0, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(
            h.call(SYSCALL_MMAP, [hole, PAGE_SIZE, 0b011, 0, 0, 0]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(h.call(SYSCALL_MUNMAP, [hole, PAGE_SIZE, 0, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.frames.in_use(), before);
        assert!(h.console.out.is_empty());
    }

    #[test]
    fn set_priority_rejects_low_values() {
        let mut h = Harness::new();
        assert_eq!(h.call(SYSCALL_SET_PRIORITY, [5, 0, 0, 0, 0, 0]), Ok(5));
        assert_eq!(h.call(SYSCALL_SET_PRIORITY, [1, 0, 0, 0, 0, 0]), Err(Error::InvalidArgument));
        assert_eq!(h.tasks.current().unwrap().priority(), 5);
    }

    #[test]
    fn task_info_reports_running_and_elapsed_millis() {
        let mut h = Harness::new();
        h.tasks.current_mut().unwrap().record_syscall(SYSCALL_TASK_INFO);
        h.clock.0.set(CPU_FREQ / 2);
        assert_eq!(h.call(SYSCALL_TASK_INFO, [BUF, 0, 0, 0, 0, 0]), Ok(0));
        let mut raw = [0u8; TaskInfo::SIZE];
        h.space().copy_in(BUF, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw[..4].try_into().unwrap()), TaskStatus::Running as u32);
        let at = 4 + 4 * SYSCALL_TASK_INFO;
        assert_eq!(u32::from_le_bytes(raw[at..at + 4].try_into().unwrap()), 1);
        let time = i32::from_le_bytes(raw[TaskInfo::SIZE - 4..].try_into().unwrap());
        assert_eq!(time, 500);
    }

    #[test]
    fn wait_without_children_fails_and_exit_frees_orphan() {
        let mut h = Harness::new();
        assert_eq!(
            h.call(SYSCALL_WAIT, [usize::MAX, 0, 0, 0, 0, 0]),
            Err(Error::Proc(ProcError::NoSuchChild))
        );
        assert_eq!(h.call(SYSCALL_EXIT, [0; 6]), Err(Error::TaskExit));
        assert!(h.tasks.is_empty());
        assert_eq!(h.frames.in_use(), 0);
    }

    #[test]
    fn exec_and_spawn_of_unknown_program_fail_without_side_effects() {
        let mut h = Harness::new();
        h.space().copy_out(BUF, b"nope\0").unwrap();
        assert_eq!(
            h.call(SYSCALL_EXEC, [BUF, 0, 0, 0, 0, 0]),
            Err(Error::Load(crate::loader::LoadError::NotFound))
        );
        assert_eq!(
            h.call(SYSCALL_SPAWN, [BUF, 0, 0, 0, 0, 0]),
            Err(Error::Load(crate::loader::LoadError::NotFound))
        );
        assert_eq!(h.tasks.len(), 1);
        assert!(h.tasks.current().unwrap().address_space().is_some());
    }

    #[test]
    fn task_info_layout_is_stable() {
        let info = TaskInfo { status: TaskStatus::Running, syscall_times: [0; MAX_SYSCALL_NUM], time: 7 };
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), TaskInfo::SIZE);
        assert_eq!(&bytes[TaskInfo::SIZE - 4..], &7i32.to_le_bytes());
    }
}
