// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and lifecycle helpers for the kestrel kernel
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (allocate/fork/exit/wait) + tests/syscalls.rs
//! PUBLIC API: ProcessTable (allocate/spawn/fork/exec/terminate/reap), Process, ProcState
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}, loader::LoadedImage, trap::TrapFrame
//! INVARIANTS: Pids unique among occupied slots; parent links are slot indices, never
//!             pointers; trapframes and address spaces are owned by exactly one slot

extern crate alloc;

use alloc::{boxed::Box, string::String};
use core::marker::PhantomData;

use crate::config::{BIG_STRIDE, DEFAULT_PRIORITY, KERNEL_STACK_SIZE, MAX_SYSCALL_NUM, NPROC};
use crate::loader::LoadedImage;
use crate::mm::{AddressSpace, FrameAllocator, VmError};
use crate::trap::{self, TrapFrame};

pub mod context;

pub use crate::types::Pid;
pub use context::TaskContext;

static_assertions::const_assert!(NPROC <= u64::BITS as usize);

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Errors returned by process-table operations.
#[must_use = "process errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// No free slot, or not enough frames to build the process.
    ResourceExhausted,
    /// The caller has no child matching the wait filter.
    NoSuchChild,
    /// No process is running on this hart.
    NoCurrent,
    /// Writing the exit code into the waiter's memory failed.
    Vm(VmError),
}

impl From<VmError> for ProcError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

/// Pending `wait` of a sleeping parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRequest {
    /// `None` waits for any child.
    pub filter: Option<Pid>,
    /// User address receiving the exit code; 0 skips the write.
    pub code_ptr: usize,
}

impl WaitRequest {
    fn matches(&self, pid: Pid) -> bool {
        self.filter.map_or(true, |want| want == pid)
    }
}

/// Result of a `reap` that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reaped(Pid),
    /// No matching child has exited yet; the caller now sleeps.
    Suspended,
}

#[repr(C, align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    fn boxed() -> Box<Self> {
        Box::new(Self([0; KERNEL_STACK_SIZE]))
    }
}

/// Process control block.
pub struct Process {
    pid: Pid,
    pub(crate) state: ProcState,
    parent: Option<usize>,
    address_space: Option<AddressSpace>,
    trapframe: Option<Box<TrapFrame>>,
    pub(crate) context: TaskContext,
    kernel_stack: Box<KernelStack>,
    user_stack_ptr: usize,
    priority: u64,
    pub(crate) stride: u64,
    pub(crate) pass: u64,
    pub(crate) start_time: Option<u64>,
    syscall_times: [u32; MAX_SYSCALL_NUM],
    exit_code: i32,
    wait: Option<WaitRequest>,
    name: String,
}

impl Process {
    fn empty() -> Self {
        Self {
            pid: Pid::IDLE,
            state: ProcState::Unused,
            parent: None,
            address_space: None,
            trapframe: None,
            context: TaskContext::zero(),
            kernel_stack: KernelStack::boxed(),
            user_stack_ptr: 0,
            priority: DEFAULT_PRIORITY,
            stride: BIG_STRIDE / DEFAULT_PRIORITY,
            pass: 0,
            start_time: None,
            syscall_times: [0; MAX_SYSCALL_NUM],
            exit_code: 0,
            wait: None,
            name: String::new(),
        }
    }

    // Back to `Unused`; the slot keeps its kernel stack.
    fn reset(&mut self) {
        self.pid = Pid::IDLE;
        self.state = ProcState::Unused;
        self.parent = None;
        self.address_space = None;
        self.trapframe = None;
        self.context = TaskContext::zero();
        self.user_stack_ptr = 0;
        self.set_priority(DEFAULT_PRIORITY);
        self.pass = 0;
        self.start_time = None;
        self.syscall_times = [0; MAX_SYSCALL_NUM];
        self.exit_code = 0;
        self.wait = None;
        self.name.clear();
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    /// Slot index of the parent, if it is still alive.
    pub fn parent_slot(&self) -> Option<usize> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Cycle count when the process was first dispatched.
    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn syscall_times(&self) -> &[u32; MAX_SYSCALL_NUM] {
        &self.syscall_times
    }

    pub fn user_stack_ptr(&self) -> usize {
        self.user_stack_ptr
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }

    pub fn trapframe(&self) -> Option<&TrapFrame> {
        self.trapframe.as_deref()
    }

    pub fn trapframe_mut(&mut self) -> Option<&mut TrapFrame> {
        self.trapframe.as_deref_mut()
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack.0.as_ptr() as usize + KERNEL_STACK_SIZE
    }

    /// Counts one invocation of syscall `id`; false when `id` is out of range.
    pub fn record_syscall(&mut self, id: usize) -> bool {
        match self.syscall_times.get_mut(id) {
            Some(count) => {
                *count = count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Sets the priority and derives the stride; callers validate `priority >= 2`.
    pub fn set_priority(&mut self, priority: u64) {
        self.priority = priority;
        self.stride = (BIG_STRIDE / priority.max(1)).max(1);
    }

    fn install(&mut self, image: LoadedImage, name: &str) {
        self.trapframe = Some(Box::new(TrapFrame::user_entry(image.entry, image.user_sp)));
        self.user_stack_ptr = image.user_sp;
        self.address_space = Some(image.space);
        self.name = String::from(name);
    }
}

/// Fixed-capacity process table for a single hart.
pub struct ProcessTable {
    procs: [Process; NPROC],
    occupied: u64,
    next_pid: u32,
    current: Option<usize>,
    _not_send_sync: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(ProcessTable: Send, Sync);

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| Process::empty()),
            occupied: 0,
            next_pid: 1,
            current: None,
            _not_send_sync: PhantomData,
        }
    }

    /// Claims a free slot: fresh pid, state `Used`, default priority, and a
    /// context that enters user mode through the trap return path.
    pub fn allocate(&mut self) -> Result<usize, ProcError> {
        let slot = (!self.occupied).trailing_zeros() as usize;
        if slot >= NPROC {
            log_warn!(target: "task", "process table full");
            return Err(ProcError::ResourceExhausted);
        }
        let pid = Pid::from_raw(self.next_pid);
        self.next_pid = self.next_pid.checked_add(1).unwrap_or(1);
        self.occupied |= 1 << slot;

        let proc = &mut self.procs[slot];
        proc.reset();
        proc.pid = pid;
        proc.state = ProcState::Used;
        proc.context = TaskContext::goto(trap::first_entry_address(), proc.kernel_stack_top());
        log_debug!(target: "task", "allocated pid={} slot={}", pid, slot);
        Ok(slot)
    }

    fn free(&mut self, slot: usize) {
        log_debug!(target: "task", "freed pid={} slot={}", self.procs[slot].pid, slot);
        self.procs[slot].reset();
        self.occupied &= !(1 << slot);
        if self.current == Some(slot) {
            self.current = None;
        }
    }

    fn is_occupied(&self, slot: usize) -> bool {
        slot < NPROC && self.occupied & (1 << slot) != 0
    }

    pub fn get(&self, slot: usize) -> Option<&Process> {
        self.is_occupied(slot).then(|| &self.procs[slot])
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Process> {
        if self.is_occupied(slot) {
            Some(&mut self.procs[slot])
        } else {
            None
        }
    }

    /// Occupied slots with their processes, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Process)> + '_ {
        (0..NPROC).filter(|slot| self.is_occupied(*slot)).map(|slot| (slot, &self.procs[slot]))
    }

    pub fn lookup(&self, pid: Pid) -> Option<usize> {
        self.iter().find(|(_, proc)| proc.pid == pid).map(|(slot, _)| slot)
    }

    pub fn len(&self) -> usize {
        self.occupied.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn runnable_count(&self) -> usize {
        self.iter().filter(|(_, proc)| proc.state == ProcState::Runnable).count()
    }

    /// Saved kernel context of `slot`, whether or not the slot is still occupied.
    ///
    /// A process that just exited is freed while the hart still runs on its
    /// kernel stack, so the final switch away needs somewhere to save into.
    pub(crate) fn context_mut(&mut self, slot: usize) -> Option<&mut TaskContext> {
        self.procs.get_mut(slot).map(|proc| &mut proc.context)
    }

    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, slot: Option<usize>) {
        self.current = slot;
    }

    pub fn current(&self) -> Result<&Process, ProcError> {
        self.current.and_then(|slot| self.get(slot)).ok_or(ProcError::NoCurrent)
    }

    pub fn current_mut(&mut self) -> Result<&mut Process, ProcError> {
        match self.current {
            Some(slot) => self.get_mut(slot).ok_or(ProcError::NoCurrent),
            None => Err(ProcError::NoCurrent),
        }
    }

    /// Pid of `slot`'s parent, or the idle pid for orphans.
    pub fn parent_pid(&self, slot: usize) -> Pid {
        self.get(slot)
            .and_then(|proc| proc.parent)
            .and_then(|parent| self.get(parent))
            .map_or(Pid::IDLE, |parent| parent.pid)
    }

    /// Creates a runnable process from `image`. The image's frames are
    /// returned to `frames` when no slot is free.
    pub fn spawn(
        &mut self,
        parent: Option<usize>,
        mut image: LoadedImage,
        name: &str,
        frames: &mut dyn FrameAllocator,
    ) -> Result<usize, ProcError> {
        let slot = match self.allocate() {
            Ok(slot) => slot,
            Err(err) => {
                image.space.release(frames);
                return Err(err);
            }
        };
        let parent = parent.filter(|p| self.is_occupied(*p));
        let proc = &mut self.procs[slot];
        proc.install(image, name);
        proc.parent = parent;
        proc.state = ProcState::Runnable;
        log_info!(target: "task", "spawned pid={} name={}", proc.pid, name);
        Ok(slot)
    }

    /// Replaces `slot`'s image in place; pid, parent, priority and counters survive.
    pub fn exec(
        &mut self,
        slot: usize,
        image: LoadedImage,
        name: &str,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), ProcError> {
        let proc = self.get_mut(slot).ok_or(ProcError::NoCurrent)?;
        if let Some(mut old) = proc.address_space.take() {
            old.release(frames);
        }
        proc.install(image, name);
        log_info!(target: "task", "exec pid={} name={}", proc.pid, name);
        Ok(())
    }

    /// Duplicates `slot` into a new runnable child whose `a0` reads 0.
    pub fn fork(&mut self, slot: usize, frames: &mut dyn FrameAllocator) -> Result<usize, ProcError> {
        let parent = self.get(slot).ok_or(ProcError::NoCurrent)?;
        let frame = parent.trapframe.as_deref().copied().ok_or(ProcError::NoCurrent)?;
        let space = parent.address_space.as_ref().ok_or(ProcError::NoCurrent)?;
        let mut space = space.duplicate(frames).map_err(|_| ProcError::ResourceExhausted)?;
        let (user_sp, priority, name) = (parent.user_stack_ptr, parent.priority, parent.name.clone());

        let child = match self.allocate() {
            Ok(child) => child,
            Err(err) => {
                space.release(frames);
                return Err(err);
            }
        };
        let proc = &mut self.procs[child];
        let mut frame = frame;
        frame.set_a0(0);
        proc.trapframe = Some(Box::new(frame));
        proc.address_space = Some(space);
        proc.user_stack_ptr = user_sp;
        proc.set_priority(priority);
        proc.name = name;
        proc.parent = Some(slot);
        proc.state = ProcState::Runnable;
        log_debug!(target: "task", "fork parent slot={} child pid={}", slot, proc.pid);
        Ok(child)
    }

    /// Ends `slot` with `code`.
    ///
    /// The address space and trapframe go back immediately. Live children become
    /// orphans and zombie children are freed. An orphan is freed on the spot;
    /// otherwise the slot stays a zombie until its parent reaps it, which happens
    /// right here when the parent is already sleeping in a matching wait.
    pub fn terminate(&mut self, slot: usize, code: i32, frames: &mut dyn FrameAllocator) {
        let Some(proc) = self.get_mut(slot) else {
            return;
        };
        if let Some(mut space) = proc.address_space.take() {
            space.release(frames);
        }
        proc.trapframe = None;
        proc.wait = None;
        proc.exit_code = code;
        proc.state = ProcState::Zombie;
        log_info!(target: "task", "exit pid={} code={}", proc.pid, code);

        for child in 0..NPROC {
            if !self.is_occupied(child) || self.procs[child].parent != Some(slot) {
                continue;
            }
            self.procs[child].parent = None;
            if self.procs[child].state == ProcState::Zombie {
                self.free(child);
            }
        }

        match self.procs[slot].parent {
            None => self.free(slot),
            Some(parent) => self.complete_wait(parent, slot),
        }
    }

    // Wakes `parent` if it sleeps in a wait that `child` satisfies.
    fn complete_wait(&mut self, parent: usize, child: usize) {
        let Some(waiter) = self.get(parent) else {
            return;
        };
        let Some(request) = waiter.wait else {
            return;
        };
        if waiter.state != ProcState::Sleeping || !request.matches(self.procs[child].pid) {
            return;
        }
        let ret = match self.collect(parent, child, request.code_ptr) {
            Ok(pid) => pid.as_raw() as usize,
            Err(_) => usize::MAX,
        };
        let waiter = &mut self.procs[parent];
        waiter.wait = None;
        if let Some(frame) = waiter.trapframe.as_deref_mut() {
            frame.set_a0(ret);
        }
        waiter.state = ProcState::Runnable;
    }

    // Writes the exit code for `parent` and frees the zombie `child`.
    fn collect(&mut self, parent: usize, child: usize, code_ptr: usize) -> Result<Pid, ProcError> {
        let code = self.procs[child].exit_code;
        if code_ptr != 0 {
            let space = self.procs[parent].address_space.as_mut().ok_or(ProcError::NoCurrent)?;
            space.copy_out(code_ptr, &code.to_le_bytes())?;
        }
        let pid = self.procs[child].pid;
        self.free(child);
        Ok(pid)
    }

    /// Reaps a zombie child of `slot` matching `filter` (`None` = any child).
    ///
    /// Without a matching zombie but with a matching live child, `slot` goes to
    /// sleep and is finished later by [`ProcessTable::terminate`]. A failing
    /// exit-code write leaves the child unreaped.
    pub fn reap(
        &mut self,
        slot: usize,
        filter: Option<Pid>,
        code_ptr: usize,
    ) -> Result<WaitOutcome, ProcError> {
        let request = WaitRequest { filter, code_ptr };
        let mut found = false;
        let mut zombie = None;
        for (child, proc) in self.iter() {
            if proc.parent != Some(slot) || !request.matches(proc.pid) {
                continue;
            }
            found = true;
            if proc.state == ProcState::Zombie {
                zombie = Some(child);
                break;
            }
        }
        if !found {
            return Err(ProcError::NoSuchChild);
        }
        if let Some(child) = zombie {
            return self.collect(slot, child, code_ptr).map(WaitOutcome::Reaped);
        }
        let proc = self.get_mut(slot).ok_or(ProcError::NoCurrent)?;
        proc.state = ProcState::Sleeping;
        proc.wait = Some(request);
        Ok(WaitOutcome::Suspended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FramePool, PAGE_SIZE};

    const DATA: usize = 0x1000;
    const RW: usize = 0b011;

    fn image(frames: &mut FramePool) -> LoadedImage {
        let mut space = AddressSpace::new();
        space.map_region(DATA, PAGE_SIZE, RW, frames).unwrap();
        space.init_heap(DATA + PAGE_SIZE);
        LoadedImage { space, entry: DATA, user_sp: DATA + PAGE_SIZE }
    }

    fn read_code(table: &ProcessTable, slot: usize) -> i32 {
        let mut raw = [0u8; 4];
        table.get(slot).unwrap().address_space().unwrap().copy_in(DATA, &mut raw).unwrap();
        i32::from_le_bytes(raw)
    }

    #[test]
    fn allocate_hands_out_unique_pids_until_full() {
        let mut table = ProcessTable::new();
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..NPROC {
            let slot = table.allocate().unwrap();
            let proc = table.get(slot).unwrap();
            assert_eq!(proc.state(), ProcState::Used);
            assert_eq!(proc.priority(), DEFAULT_PRIORITY);
            assert_eq!(proc.stride(), BIG_STRIDE / DEFAULT_PRIORITY);
            assert_eq!(proc.context.sp, proc.kernel_stack_top());
            assert!(!pids.contains(&proc.pid()));
            pids.push(proc.pid());
        }
        assert_eq!(table.allocate(), Err(ProcError::ResourceExhausted));
        assert_eq!(table.len(), NPROC);
    }

    #[test]
    fn freed_slot_is_reused_with_fresh_pid() {
        let mut pool = FramePool::heap(8);
        let mut table = ProcessTable::new();
        let slot = table.allocate().unwrap();
        let pid = table.get(slot).unwrap().pid();
        table.terminate(slot, 0, &mut pool);
        assert!(table.get(slot).is_none());
        let again = table.allocate().unwrap();
        assert_eq!(again, slot);
        assert_ne!(table.get(again).unwrap().pid(), pid);
    }

    #[test]
    fn current_requires_a_running_slot() {
        let mut table = ProcessTable::new();
        assert_eq!(table.current().err(), Some(ProcError::NoCurrent));
        let slot = table.allocate().unwrap();
        table.set_current(Some(slot));
        assert_eq!(table.current().unwrap().pid(), table.get(slot).unwrap().pid());
    }

    #[test]
    fn spawn_sets_up_trapframe_and_parent() {
        let mut pool = FramePool::heap(8);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let child = table.spawn(Some(parent), image(&mut pool), "child", &mut pool).unwrap();
        let proc = table.get(child).unwrap();
        assert_eq!(proc.state(), ProcState::Runnable);
        assert_eq!(proc.trapframe().unwrap().sepc, DATA);
        assert_eq!(proc.trapframe().unwrap().sp(), DATA + PAGE_SIZE);
        assert_eq!(proc.name(), "child");
        assert_eq!(table.parent_pid(child), table.get(parent).unwrap().pid());
        assert_eq!(table.parent_pid(parent), Pid::IDLE);
    }

    #[test]
    fn spawn_without_slot_returns_frames() {
        let mut pool = FramePool::heap(8);
        let mut table = ProcessTable::new();
        for _ in 0..NPROC {
            table.allocate().unwrap();
        }
        let img = image(&mut pool);
        let in_use = pool.in_use();
        assert!(in_use > 0);
        assert_eq!(table.spawn(None, img, "late", &mut pool), Err(ProcError::ResourceExhausted));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn fork_copies_memory_and_zeroes_child_a0() {
        let mut pool = FramePool::heap(16);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        {
            let proc = table.get_mut(parent).unwrap();
            proc.address_space_mut().unwrap().copy_out(DATA, &7i32.to_le_bytes()).unwrap();
            proc.trapframe_mut().unwrap().set_a0(99);
            proc.set_priority(4);
        }
        let child = table.fork(parent, &mut pool).unwrap();
        assert_eq!(read_code(&table, child), 7);
        let proc = table.get(child).unwrap();
        assert_eq!(proc.trapframe().unwrap().a0(), 0);
        assert_eq!(proc.stride(), BIG_STRIDE / 4);
        assert_eq!(proc.parent_slot(), Some(parent));
        assert_ne!(
            proc.address_space().unwrap().translate(DATA).unwrap(),
            table.get(parent).unwrap().address_space().unwrap().translate(DATA).unwrap()
        );
    }

    #[test]
    fn exec_swaps_image_and_releases_old_frames() {
        let mut pool = FramePool::heap(16);
        let mut table = ProcessTable::new();
        let slot = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let in_use = pool.in_use();
        let mut next = image(&mut pool);
        next.entry = DATA + 8;
        table.exec(slot, next, "next", &mut pool).unwrap();
        assert_eq!(pool.in_use(), in_use);
        let proc = table.get(slot).unwrap();
        assert_eq!(proc.trapframe().unwrap().sepc, DATA + 8);
        assert_eq!(proc.name(), "next");
    }

    #[test]
    fn reap_without_children_fails() {
        let mut pool = FramePool::heap(8);
        let mut table = ProcessTable::new();
        let slot = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        assert_eq!(table.reap(slot, None, 0), Err(ProcError::NoSuchChild));
        assert_eq!(table.reap(slot, Some(Pid::from_raw(42)), 0), Err(ProcError::NoSuchChild));
    }

    #[test]
    fn reap_collects_zombie_and_writes_code() {
        let mut pool = FramePool::heap(16);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let child = table.fork(parent, &mut pool).unwrap();
        let child_pid = table.get(child).unwrap().pid();
        table.terminate(child, 3, &mut pool);
        assert_eq!(table.get(child).unwrap().state(), ProcState::Zombie);

        assert_eq!(table.reap(parent, None, DATA), Ok(WaitOutcome::Reaped(child_pid)));
        assert_eq!(read_code(&table, parent), 3);
        assert!(table.get(child).is_none());
    }

    #[test]
    fn reap_fault_keeps_zombie() {
        let mut pool = FramePool::heap(16);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let child = table.fork(parent, &mut pool).unwrap();
        table.terminate(child, 1, &mut pool);
        assert_eq!(table.reap(parent, None, 0x40_0000), Err(ProcError::Vm(VmError::Fault)));
        assert_eq!(table.get(child).unwrap().state(), ProcState::Zombie);
    }

    #[test]
    fn waiting_parent_is_woken_by_child_exit() {
        let mut pool = FramePool::heap(16);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let child = table.fork(parent, &mut pool).unwrap();
        let child_pid = table.get(child).unwrap().pid();

        assert_eq!(table.reap(parent, Some(child_pid), DATA), Ok(WaitOutcome::Suspended));
        assert_eq!(table.get(parent).unwrap().state(), ProcState::Sleeping);

        table.terminate(child, -5, &mut pool);
        let proc = table.get(parent).unwrap();
        assert_eq!(proc.state(), ProcState::Runnable);
        assert_eq!(proc.trapframe().unwrap().a0(), child_pid.as_raw() as usize);
        assert_eq!(read_code(&table, parent), -5);
        assert!(table.get(child).is_none());
    }

    #[test]
    fn wait_filter_ignores_other_children() {
        let mut pool = FramePool::heap(32);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let first = table.fork(parent, &mut pool).unwrap();
        let second = table.fork(parent, &mut pool).unwrap();
        let second_pid = table.get(second).unwrap().pid();

        assert_eq!(table.reap(parent, Some(second_pid), 0), Ok(WaitOutcome::Suspended));
        table.terminate(first, 0, &mut pool);
        assert_eq!(table.get(parent).unwrap().state(), ProcState::Sleeping);
        assert_eq!(table.get(first).unwrap().state(), ProcState::Zombie);

        table.terminate(second, 0, &mut pool);
        assert_eq!(table.get(parent).unwrap().state(), ProcState::Runnable);
    }

    #[test]
    fn exit_orphans_children_and_frees_zombies() {
        let mut pool = FramePool::heap(32);
        let mut table = ProcessTable::new();
        let parent = table.spawn(None, image(&mut pool), "init", &mut pool).unwrap();
        let live = table.fork(parent, &mut pool).unwrap();
        let dead = table.fork(parent, &mut pool).unwrap();
        table.terminate(dead, 0, &mut pool);

        table.terminate(parent, 0, &mut pool);
        assert!(table.get(parent).is_none());
        assert!(table.get(dead).is_none());
        assert_eq!(table.get(live).unwrap().parent_slot(), None);
        assert_eq!(table.parent_pid(live), Pid::IDLE);

        table.terminate(live, 0, &mut pool);
        assert!(table.is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn syscall_counter_ignores_out_of_range_ids() {
        let mut table = ProcessTable::new();
        let slot = table.allocate().unwrap();
        let proc = table.get_mut(slot).unwrap();
        assert!(proc.record_syscall(64));
        assert!(proc.record_syscall(64));
        assert!(!proc.record_syscall(MAX_SYSCALL_NUM));
        assert_eq!(proc.syscall_times()[64], 2);
    }
}
