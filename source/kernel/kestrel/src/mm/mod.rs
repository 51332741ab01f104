// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management for user processes (Sv39)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PageTable, PageFlags, MapError, AddressSpace, VmError, Prot,
//!             FrameAllocator, FramePool, PAGE_SIZE
//! DEPENDS_ON: bitflags, alloc
//! INVARIANTS: One frame per mapped user page; max_page tracks the highest
//!             mapped page; failed multi-page operations leave no partial state

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::{AddressSpace, Prot, VmError, USER_TOP};
pub use frame::{FrameAllocator, FramePool};
pub use page_table::{MapError, PageFlags, PageTable, PAGE_SIZE};

#[cfg(feature = "failpoints")]
pub use page_table::failpoints;

#[cfg(test)]
mod tests_prop;
