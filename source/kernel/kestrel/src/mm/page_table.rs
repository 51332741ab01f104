// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::types::PhysAddr;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const PPN_SHIFT: usize = 10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping was refused by an injected failure.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf entry covers the address.
    NotMapped,
}

#[repr(align(4096))]
struct PageTablePage {
    entries: [usize; PT_ENTRIES],
}

impl PageTablePage {
    const fn new() -> Self {
        Self { entries: [0; PT_ENTRIES] }
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
///
/// Table pages come from the kernel heap, which is identity mapped, so their
/// addresses double as physical page numbers in non-leaf entries.
pub struct PageTable {
    root: NonNull<PageTablePage>,
    owned: Vec<NonNull<PageTablePage>>,
}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new() -> Self {
        let root = Self::alloc_page();
        Self { root, owned: vec![root] }
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.as_ptr() as usize / PAGE_SIZE
    }

    /// Looks up the leaf entry mapped at page-aligned `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 {
            return None;
        }
        self.leaf(va).map(|entry| *entry)
    }

    /// Translates any address inside a mapped page.
    pub fn translate(&self, va: usize) -> Option<(PhysAddr, PageFlags)> {
        let entry = *self.leaf(va & !(PAGE_SIZE - 1))?;
        let base = PhysAddr::from_ppn(entry >> PPN_SHIFT);
        Some((base.offset(va % PAGE_SIZE), PageFlags::from_bits_truncate(entry)))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
            return Err(MapError::InvalidFlags);
        }
        #[cfg(feature = "failpoints")]
        if failpoints::take() {
            return Err(MapError::PermissionDenied);
        }

        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is either the root or a page recorded in `owned`.
            let entry = unsafe { &mut (*table.as_ptr()).entries[*index] };
            if level == indices.len() - 1 {
                if *entry & PageFlags::VALID.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                *entry = (pa.ppn() << PPN_SHIFT) | flags.bits();
                return Ok(());
            }

            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                let next = ((*entry >> PPN_SHIFT) * PAGE_SIZE) as *mut PageTablePage;
                table = NonNull::new(next).ok_or(MapError::OutOfRange)?;
                continue;
            }

            let next = Self::alloc_page();
            self.owned.push(next);
            let ppn = next.as_ptr() as usize / PAGE_SIZE;
            *entry = (ppn << PPN_SHIFT) | PageFlags::VALID.bits();
            table = next;
        }
        Ok(())
    }

    /// Clears the leaf at `va`, returning the frame it referenced.
    pub fn unmap(&mut self, va: usize) -> Result<PhysAddr, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        let entry = self.leaf_mut(va).ok_or(MapError::NotMapped)?;
        let pa = PhysAddr::from_ppn(*entry >> PPN_SHIFT);
        *entry = 0;
        Ok(pa)
    }

    fn leaf(&self, va: usize) -> Option<&usize> {
        let ptr = self.walk(va)?;
        // SAFETY: `walk` only yields pointers into pages owned by this table.
        Some(unsafe { &*ptr })
    }

    fn leaf_mut(&mut self, va: usize) -> Option<&mut usize> {
        let ptr = self.walk(va)?;
        // SAFETY: as in `leaf`; `&mut self` guarantees exclusivity.
        Some(unsafe { &mut *ptr })
    }

    fn walk(&self, va: usize) -> Option<*mut usize> {
        if !is_canonical_sv39(va) {
            return None;
        }
        let indices = vpn_indices(va);
        let mut table = self.root;
        for (level, index) in indices.iter().enumerate() {
            // SAFETY: `table` is either the root or a page recorded in `owned`.
            let slot = unsafe { &mut (*table.as_ptr()).entries[*index] as *mut usize };
            let entry = unsafe { *slot };
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            let is_leaf = entry & LEAF_PERMS.bits() != 0;
            if level == indices.len() - 1 {
                return if is_leaf { Some(slot) } else { None };
            }
            if is_leaf {
                return None;
            }
            let next = ((entry >> PPN_SHIFT) * PAGE_SIZE) as *mut PageTablePage;
            table = NonNull::new(next)?;
        }
        None
    }

    fn alloc_page() -> NonNull<PageTablePage> {
        let boxed = Box::new(PageTablePage::new());
        // SAFETY: Box never yields a null pointer.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for page in self.owned.drain(..) {
            // SAFETY: every pointer originates from `alloc_page` and is unique.
            unsafe { drop(Box::from_raw(page.as_ptr())) };
        }
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

// Root level first.
fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

pub(crate) fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

#[cfg(feature = "failpoints")]
pub mod failpoints {
    #[cfg(not(test))]
    use core::sync::atomic::{AtomicBool, Ordering};

    #[cfg(not(test))]
    static DENY_NEXT_MAP: AtomicBool = AtomicBool::new(false);

    // Unit tests run on parallel threads; keep injected failures per thread.
    #[cfg(test)]
    std::thread_local! {
        static DENY_NEXT_MAP: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
    }

    /// Forces the next `map` invocation to return [`MapError::PermissionDenied`](super::MapError).
    pub fn deny_next_map() {
        set(true);
    }

    /// Disarms a pending injected failure.
    pub fn clear() {
        set(false);
    }

    #[cfg(not(test))]
    fn set(value: bool) {
        DENY_NEXT_MAP.store(value, Ordering::SeqCst);
    }

    #[cfg(not(test))]
    pub(super) fn take() -> bool {
        DENY_NEXT_MAP.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    fn set(value: bool) {
        DENY_NEXT_MAP.with(|flag| flag.set(value));
    }

    #[cfg(test)]
    pub(super) fn take() -> bool {
        DENY_NEXT_MAP.with(|flag| flag.replace(false))
    }
}
