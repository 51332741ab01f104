// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation for user mappings
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, FramePool
//! DEPENDS_ON: types::PhysAddr, alloc::vec
//! INVARIANTS: Frames are handed out zeroed and page aligned; a frame is owned by
//!             at most one PTE until it is returned through `free_frame`

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use super::PAGE_SIZE;
use crate::types::PhysAddr;

/// Source of physical frames for user pages.
///
/// Double frees and frees of frames that were never allocated are caller bugs
/// and are not detected.
pub trait FrameAllocator {
    /// Returns a zeroed frame, or `None` when memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;
    /// Returns `frame` to the allocator.
    fn free_frame(&mut self, frame: PhysAddr);
}

#[repr(C, align(4096))]
#[derive(Clone)]
struct Page([u8; PAGE_SIZE]);

/// Bump range over identity-mapped memory with a recycled free list.
pub struct FramePool {
    cursor: usize,
    end: usize,
    recycled: Vec<PhysAddr>,
    in_use: usize,
    _backing: Option<Box<[Page]>>,
}

impl FramePool {
    /// Pool backed by `pages` frames carved out of the kernel heap.
    pub fn heap(pages: usize) -> Self {
        let backing = alloc::vec![Page([0; PAGE_SIZE]); pages].into_boxed_slice();
        let start = backing.as_ptr() as usize;
        Self {
            cursor: start,
            end: start + pages * PAGE_SIZE,
            recycled: Vec::new(),
            in_use: 0,
            _backing: Some(backing),
        }
    }

    /// Pool over the physical range `[start, end)`.
    ///
    /// # Safety
    /// The range must be identity mapped, writable, and unused by anything else
    /// for the lifetime of the pool.
    pub unsafe fn from_range(start: PhysAddr, end: PhysAddr) -> Self {
        let cursor = (start.raw() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = end.raw() & !(PAGE_SIZE - 1);
        Self { cursor, end: end.max(cursor), recycled: Vec::new(), in_use: 0, _backing: None }
    }

    /// Frames that can still be handed out.
    pub fn available(&self) -> usize {
        self.recycled.len() + (self.end - self.cursor) / PAGE_SIZE
    }

    /// Frames currently owned by callers.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

impl FrameAllocator for FramePool {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let frame = match self.recycled.pop() {
            Some(frame) => frame,
            None => {
                if self.cursor >= self.end {
                    return None;
                }
                let frame = PhysAddr::from_raw(self.cursor);
                self.cursor += PAGE_SIZE;
                frame
            }
        };
        // SAFETY: the frame lies inside the pool's range and is not owned by anyone else.
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
        self.in_use += 1;
        Some(frame)
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        debug_assert!(frame.is_page_aligned());
        self.in_use = self.in_use.saturating_sub(1);
        self.recycled.push(frame);
    }
}
