// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process Sv39 address spaces: translation, user copies, mmap/munmap and
//! the program break.

extern crate alloc;

use alloc::{collections::BTreeSet, vec::Vec};

use bitflags::bitflags;

use super::frame::FrameAllocator;
use super::page_table::{MapError, PageFlags, PageTable, PAGE_SIZE};
use crate::types::PhysAddr;

/// First address above the user half of the Sv39 space.
pub const USER_TOP: usize = 1 << 38;

bitflags! {
    /// Protection bits accepted by `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    /// Leaf flags for a user page with this protection.
    pub fn page_flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.bits() << 1) | PageFlags::USER | PageFlags::VALID
    }
}

/// Errors reported by address-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Bad alignment, zero length, bad protection bits or range overflow.
    InvalidArgument,
    /// A page in the range has no valid user mapping.
    Unmapped,
    /// A page in the range is already mapped.
    AlreadyMapped,
    /// A user copy touched a missing page or one lacking the needed permission.
    Fault,
    /// No frame was available, or installing a mapping failed.
    OutOfMemory,
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::Overlap => Self::AlreadyMapped,
            MapError::NotMapped => Self::Unmapped,
            MapError::Unaligned | MapError::OutOfRange | MapError::InvalidFlags => {
                Self::InvalidArgument
            }
            MapError::PermissionDenied => Self::OutOfMemory,
        }
    }
}

/// Page table plus the bookkeeping of one process's user mappings.
///
/// Frames backing user pages are owned by this space until `unmap_region` or
/// `release` hands them back; dropping a space without `release` leaks them.
pub struct AddressSpace {
    page_table: PageTable,
    pages: BTreeSet<usize>,
    program_brk: usize,
    heap_bottom: usize,
    max_page: usize,
}

impl AddressSpace {
    /// Creates a space with no user mappings.
    pub fn new() -> Self {
        Self {
            page_table: PageTable::new(),
            pages: BTreeSet::new(),
            program_brk: 0,
            heap_bottom: 0,
            max_page: 0,
        }
    }

    /// Places an empty heap at `base`.
    pub fn init_heap(&mut self, base: usize) {
        self.heap_bottom = base;
        self.program_brk = base;
    }

    pub fn program_brk(&self) -> usize {
        self.program_brk
    }

    pub fn heap_bottom(&self) -> usize {
        self.heap_bottom
    }

    /// One past the highest mapped user page number.
    pub fn max_page(&self) -> usize {
        self.max_page
    }

    /// Start addresses of every mapped user page, ascending.
    pub fn mapped_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.iter().map(|vpn| vpn * PAGE_SIZE)
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// SATP value selecting this space in Sv39 mode.
    pub fn satp(&self) -> usize {
        const MODE_SV39: usize = 8;
        (MODE_SV39 << 60) | self.page_table.root_ppn()
    }

    /// Translates `va` to the physical address it maps to.
    pub fn translate(&self, va: usize) -> Result<PhysAddr, VmError> {
        self.page_table.translate(va).map(|(pa, _)| pa).ok_or(VmError::Unmapped)
    }

    /// Copies `dst.len()` bytes from user address `va`.
    #[must_use]
    pub fn copy_in(&self, va: usize, dst: &mut [u8]) -> Result<(), VmError> {
        let need = PageFlags::READ | PageFlags::USER;
        let mut done = 0;
        for (pa, chunk) in self.user_chunks(va, dst.len(), need)? {
            // SAFETY: `pa` lies inside a user frame owned by this space and `chunk`
            // never crosses the end of that frame.
            unsafe {
                core::ptr::copy_nonoverlapping(pa.as_mut_ptr(), dst[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies `src` to user address `va`.
    #[must_use]
    pub fn copy_out(&mut self, va: usize, src: &[u8]) -> Result<(), VmError> {
        let need = PageFlags::WRITE | PageFlags::USER;
        let mut done = 0;
        for (pa, chunk) in self.user_chunks(va, src.len(), need)? {
            // SAFETY: see `copy_in`.
            unsafe {
                core::ptr::copy_nonoverlapping(src[done..].as_ptr(), pa.as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string of at most `max_len` bytes from `va`.
    ///
    /// The terminator is not included; a string with no terminator within
    /// `max_len` bytes is truncated.
    #[must_use]
    pub fn copy_in_str(&self, va: usize, max_len: usize) -> Result<Vec<u8>, VmError> {
        let need = PageFlags::READ | PageFlags::USER;
        let mut out = Vec::new();
        let mut cursor = va;
        while out.len() < max_len {
            let pa = self.user_page(cursor, need)?;
            let in_page = PAGE_SIZE - cursor % PAGE_SIZE;
            let take = in_page.min(max_len - out.len());
            // SAFETY: `take` bytes from `pa` stay within one mapped user frame.
            let bytes = unsafe { core::slice::from_raw_parts(pa.as_mut_ptr(), take) };
            if let Some(nul) = bytes.iter().position(|b| *b == 0) {
                out.extend_from_slice(&bytes[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(bytes);
            cursor = cursor.checked_add(take).ok_or(VmError::Fault)?;
        }
        Ok(out)
    }

    /// Backs `[start, start + len)` with fresh zeroed frames.
    ///
    /// Either every page is mapped or none is: an allocation or mapping failure
    /// unwinds the pages mapped so far and reports `OutOfMemory`.
    #[must_use]
    pub fn map_region(
        &mut self,
        start: usize,
        len: usize,
        prot: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), VmError> {
        let prot = Prot::from_bits(prot).filter(|p| !p.is_empty()).ok_or(VmError::InvalidArgument)?;
        let end = user_range(start, len)?;
        self.map_pages(start, end, prot.page_flags(), frames)
    }

    /// Returns the frames behind `[start, start + len)` to `frames`.
    ///
    /// Fails with `Unmapped`, changing nothing, if any page in the range lacks a
    /// valid user mapping.
    #[must_use]
    pub fn unmap_region(
        &mut self,
        start: usize,
        len: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), VmError> {
        let end = user_range(start, len)?;
        let user_mapped = |va: usize| {
            self.page_table
                .lookup(va)
                .is_some_and(|entry| entry & PageFlags::USER.bits() != 0)
        };
        if !(start..end).step_by(PAGE_SIZE).all(user_mapped) {
            return Err(VmError::Unmapped);
        }
        for va in (start..end).step_by(PAGE_SIZE) {
            self.unmap_page(va, frames)?;
        }
        self.refresh_max_page();
        Ok(())
    }

    /// Moves the program break by `delta` bytes and returns the previous break.
    #[must_use]
    pub fn grow_break(
        &mut self,
        delta: isize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<usize, VmError> {
        let old = self.program_brk;
        let new = old.checked_add_signed(delta).ok_or(VmError::InvalidArgument)?;
        if new < self.heap_bottom || new > USER_TOP {
            return Err(VmError::InvalidArgument);
        }
        let (old_top, new_top) = (page_round_up(old), page_round_up(new));
        if new_top > old_top {
            let flags = (Prot::READ | Prot::WRITE).page_flags();
            // A heap page already claimed by mmap cannot be handed out again.
            self.map_pages(old_top, new_top, flags, frames).map_err(|_| VmError::OutOfMemory)?;
        } else {
            for va in (new_top..old_top).step_by(PAGE_SIZE) {
                if self.pages.contains(&(va / PAGE_SIZE)) {
                    self.unmap_page(va, frames)?;
                }
            }
            self.refresh_max_page();
        }
        self.program_brk = new;
        Ok(old)
    }

    /// Deep copy for `fork`: every user page gets a new frame with the same
    /// contents and permissions.
    #[must_use]
    pub fn duplicate(&self, frames: &mut dyn FrameAllocator) -> Result<Self, VmError> {
        let mut child = Self::new();
        child.heap_bottom = self.heap_bottom;
        child.program_brk = self.program_brk;
        for va in self.mapped_pages() {
            let (src, flags) = self.page_table.translate(va).ok_or(VmError::Unmapped)?;
            let copied = child.map_page(va, flags, frames).map(|dst| {
                // SAFETY: both frames are whole, distinct, owned pages.
                unsafe { core::ptr::copy_nonoverlapping(src.as_mut_ptr(), dst.as_mut_ptr(), PAGE_SIZE) };
            });
            if let Err(err) = copied {
                child.release(frames);
                return Err(err);
            }
        }
        child.refresh_max_page();
        Ok(child)
    }

    /// Unmaps every user page and returns all frames to `frames`.
    pub fn release(&mut self, frames: &mut dyn FrameAllocator) {
        let pages: Vec<usize> = self.mapped_pages().collect();
        for va in pages {
            let _ = self.unmap_page(va, frames);
        }
        self.max_page = 0;
        self.program_brk = self.heap_bottom;
    }

    fn map_pages(
        &mut self,
        start: usize,
        end: usize,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), VmError> {
        if (start..end).step_by(PAGE_SIZE).any(|va| self.page_table.lookup(va).is_some()) {
            return Err(VmError::AlreadyMapped);
        }
        for va in (start..end).step_by(PAGE_SIZE) {
            if let Err(err) = self.map_page(va, flags, frames) {
                for done in (start..va).step_by(PAGE_SIZE) {
                    let _ = self.unmap_page(done, frames);
                }
                self.refresh_max_page();
                log_warn!(target: "mm", "map {:#x}..{:#x} failed at {:#x}: {:?}", start, end, va, err);
                return Err(VmError::OutOfMemory);
            }
        }
        self.refresh_max_page();
        Ok(())
    }

    fn map_page(
        &mut self,
        va: usize,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PhysAddr, VmError> {
        let frame = frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        if let Err(err) = self.page_table.map(va, frame, flags) {
            frames.free_frame(frame);
            return Err(err.into());
        }
        self.pages.insert(va / PAGE_SIZE);
        Ok(frame)
    }

    fn unmap_page(&mut self, va: usize, frames: &mut dyn FrameAllocator) -> Result<(), VmError> {
        let frame = self.page_table.unmap(va)?;
        self.pages.remove(&(va / PAGE_SIZE));
        frames.free_frame(frame);
        Ok(())
    }

    fn refresh_max_page(&mut self) {
        self.max_page = self.pages.last().map_or(0, |vpn| vpn + 1);
    }

    fn user_page(&self, va: usize, need: PageFlags) -> Result<PhysAddr, VmError> {
        match self.page_table.translate(va) {
            Some((pa, flags)) if flags.contains(need) => Ok(pa),
            _ => Err(VmError::Fault),
        }
    }

    // Splits `[va, va + len)` into per-page physical chunks, checking every page
    // before any byte moves.
    fn user_chunks(
        &self,
        va: usize,
        len: usize,
        need: PageFlags,
    ) -> Result<Vec<(PhysAddr, usize)>, VmError> {
        let end = va.checked_add(len).ok_or(VmError::Fault)?;
        let mut chunks = Vec::new();
        let mut cursor = va;
        while cursor < end {
            let pa = self.user_page(cursor, need)?;
            let chunk = (PAGE_SIZE - cursor % PAGE_SIZE).min(end - cursor);
            chunks.push((pa, chunk));
            cursor += chunk;
        }
        Ok(chunks)
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// Validates a user range and returns its page-rounded end.
fn user_range(start: usize, len: usize) -> Result<usize, VmError> {
    if start % PAGE_SIZE != 0 || len == 0 {
        return Err(VmError::InvalidArgument);
    }
    let end = start.checked_add(len).ok_or(VmError::InvalidArgument)?;
    if end > USER_TOP {
        return Err(VmError::InvalidArgument);
    }
    Ok(page_round_up(end))
}
