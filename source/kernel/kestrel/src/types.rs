// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer syscall decoding (debug-friendly, low overhead)
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, Pid
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, PAGE_SIZE
//! INVARIANTS: Enforce canonical Sv39 addresses; page alignment checks; prevent type confusion

use crate::config::IDLE_PID;
use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};
use core::fmt;

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address handed out by the frame allocator.
///
/// Kernel memory is identity mapped, so a `PhysAddr` can be turned into a kernel
/// pointer once it is known to refer to an allocated frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Physical page number, as stored in a PTE.
    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 / PAGE_SIZE
    }

    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn * PAGE_SIZE)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Process identifier (PID).
///
/// **Ownership**: Only `ProcessTable` can create PIDs.
/// **Invariant**: PID 0 is reserved for the idle reaper and never names a table slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Creates a PID from a raw value (kernel-internal only).
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw PID value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Idle PID, reported as the parent of orphans.
    pub const IDLE: Self = Self(IDLE_PID);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

impl From<Pid> for usize {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.0 as usize
    }
}
