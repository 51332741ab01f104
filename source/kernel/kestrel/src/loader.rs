// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program loading for exec/spawn and the initial process
//! OWNERS: @kernel-team
//! PUBLIC API: ProgramLoader, LoadedImage, LoadError, AppLoader
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator}
//! INVARIANTS: A failed load releases every frame it took; images never
//!             overlap the guard page or the user stack
//!
//! Layout of a loaded image, low to high: program segments, one unmapped guard
//! page, `USER_STACK_SIZE` bytes of stack, then an empty heap starting at the
//! stack top.

extern crate alloc;

use alloc::vec::Vec;

use crate::config::{BASE_ADDRESS, USER_STACK_SIZE};
use crate::mm::{AddressSpace, FrameAllocator, Prot, VmError, PAGE_SIZE};

const ELF_MAGIC: &[u8; 4] = b"\x7FELF";
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Errors surfaced while loading a user program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// No program with the requested name is registered.
    NotFound,
    /// Frames ran out while building the image.
    OutOfMemory,
    /// The image is truncated or describes an impossible layout.
    InvalidImage,
}

impl From<VmError> for LoadError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::OutOfMemory => Self::OutOfMemory,
            _ => Self::InvalidImage,
        }
    }
}

/// Fresh address space ready to enter user mode.
pub struct LoadedImage {
    pub space: AddressSpace,
    pub entry: usize,
    pub user_sp: usize,
}

/// Resolves a program name to a populated address space.
pub trait ProgramLoader {
    fn load(&self, name: &str, frames: &mut dyn FrameAllocator) -> Result<LoadedImage, LoadError>;
}

/// Loader over images linked into the kernel, addressed by name.
///
/// Images starting with the ELF magic are mapped segment by segment; anything
/// else is treated as a flat binary entered at `BASE_ADDRESS`.
#[derive(Default)]
pub struct AppLoader {
    apps: Vec<(&'static str, &'static [u8])>,
}

impl AppLoader {
    pub const fn new() -> Self {
        Self { apps: Vec::new() }
    }

    /// Registers `image` under `name`; a later registration shadows an earlier one.
    pub fn register(&mut self, name: &'static str, image: &'static [u8]) {
        self.apps.insert(0, (name, image));
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.apps.iter().map(|(name, _)| *name)
    }

    fn find(&self, name: &str) -> Option<&'static [u8]> {
        self.apps.iter().find(|(app, _)| *app == name).map(|(_, image)| *image)
    }
}

impl ProgramLoader for AppLoader {
    fn load(&self, name: &str, frames: &mut dyn FrameAllocator) -> Result<LoadedImage, LoadError> {
        let image = self.find(name).ok_or(LoadError::NotFound)?;
        let mut space = AddressSpace::new();
        let loaded = if image.starts_with(ELF_MAGIC) {
            map_elf(image, &mut space, frames)
        } else {
            map_flat(image, &mut space, frames)
        }
        .and_then(|(entry, image_top)| {
            let stack_bottom = image_top + PAGE_SIZE;
            let stack_top = stack_bottom + USER_STACK_SIZE;
            space.map_region(stack_bottom, USER_STACK_SIZE, (Prot::READ | Prot::WRITE).bits(), frames)?;
            space.init_heap(stack_top);
            Ok((entry, stack_top))
        });
        match loaded {
            Ok((entry, user_sp)) => {
                log_debug!(target: "loader", "loaded {} entry={:#x} sp={:#x}", name, entry, user_sp);
                Ok(LoadedImage { space, entry, user_sp })
            }
            Err(err) => {
                space.release(frames);
                log_warn!(target: "loader", "load {} failed: {:?}", name, err);
                Err(err)
            }
        }
    }
}

// Returns (entry, page-aligned end of the image).
fn map_flat(
    image: &[u8],
    space: &mut AddressSpace,
    frames: &mut dyn FrameAllocator,
) -> Result<(usize, usize), LoadError> {
    let len = image.len().max(1);
    let prot = Prot::READ | Prot::WRITE | Prot::EXEC;
    space.map_region(BASE_ADDRESS, len, prot.bits(), frames)?;
    fill(space, BASE_ADDRESS, image)?;
    Ok((BASE_ADDRESS, align_up(BASE_ADDRESS + len)))
}

fn map_elf(
    bytes: &[u8],
    space: &mut AddressSpace,
    frames: &mut dyn FrameAllocator,
) -> Result<(usize, usize), LoadError> {
    if bytes.len() < 64 || bytes[4] != 2 || bytes[5] != 1 {
        return Err(LoadError::InvalidImage);
    }
    let e_entry = le_u64(&bytes[24..32]) as usize;
    let e_phoff = le_u64(&bytes[32..40]) as usize;
    let e_phentsize = le_u16(&bytes[54..56]) as usize;
    let e_phnum = le_u16(&bytes[56..58]) as usize;

    let mut image_top = 0usize;
    for i in 0..e_phnum {
        let off = e_phoff
            .checked_add(i * e_phentsize)
            .filter(|off| off + 56 <= bytes.len())
            .ok_or(LoadError::InvalidImage)?;
        if le_u32(&bytes[off..off + 4]) != PT_LOAD {
            continue;
        }
        let p_flags = le_u32(&bytes[off + 4..off + 8]);
        let p_offset = le_u64(&bytes[off + 8..off + 16]) as usize;
        let p_vaddr = le_u64(&bytes[off + 16..off + 24]) as usize;
        let p_filesz = le_u64(&bytes[off + 32..off + 40]) as usize;
        let p_memsz = le_u64(&bytes[off + 40..off + 48]) as usize;

        let file_end = p_offset.checked_add(p_filesz).ok_or(LoadError::InvalidImage)?;
        if p_filesz > p_memsz || file_end > bytes.len() {
            return Err(LoadError::InvalidImage);
        }
        let mut prot = Prot::empty();
        if p_flags & PF_R != 0 {
            prot |= Prot::READ;
        }
        if p_flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if p_flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }

        let seg_end = p_vaddr.checked_add(p_memsz).ok_or(LoadError::InvalidImage)?;
        // Segments may share a boundary page; only map the pages still missing.
        let mut va = align_down(p_vaddr);
        while va < seg_end {
            if space.translate(va).is_err() {
                space.map_region(va, PAGE_SIZE, prot.bits(), frames)?;
            }
            va += PAGE_SIZE;
        }
        fill(space, p_vaddr, &bytes[p_offset..file_end])?;
        image_top = image_top.max(align_up(seg_end));
    }
    if image_top == 0 {
        return Err(LoadError::InvalidImage);
    }
    Ok((e_entry, image_top))
}

// Kernel-side write that ignores user permissions (text is not writable).
fn fill(space: &AddressSpace, va: usize, bytes: &[u8]) -> Result<(), LoadError> {
    let mut done = 0;
    while done < bytes.len() {
        let cursor = va + done;
        let pa = space.translate(cursor)?;
        let chunk = (PAGE_SIZE - cursor % PAGE_SIZE).min(bytes.len() - done);
        // SAFETY: `pa` is a frame just mapped into `space` and `chunk` stays within it.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), pa.as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(())
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
