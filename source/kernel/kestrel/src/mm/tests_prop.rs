// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for user address spaces
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - mmap followed by munmap of the same range restores the space
//!   - mmap overlapping any mapped page fails without mutation
//!   - munmap touching any unmapped page fails without mutation
//!
//! TEST_SCENARIOS:
//!   - map_unmap_roundtrip(): mapped-page set, max_page and free frames restored
//!   - overlapping_map_is_rejected(): AlreadyMapped, nothing allocated or installed
//!   - unmap_with_hole_is_rejected(): Unmapped, nothing freed or cleared

extern crate alloc;

use alloc::vec::Vec;

use super::{AddressSpace, FramePool, VmError, PAGE_SIZE};
use proptest::prelude::*;

const POOL_PAGES: usize = 64;
const RW: usize = 0b011;

fn arb_prot() -> impl Strategy<Value = usize> {
    1usize..8
}

// (first page, page count) inside a small window so ranges collide often.
fn arb_range() -> impl Strategy<Value = (usize, usize)> {
    (1usize..32, 1usize..8)
}

fn snapshot(space: &AddressSpace) -> (Vec<usize>, usize) {
    (space.mapped_pages().collect(), space.max_page())
}

proptest! {
    #[test]
    fn map_unmap_roundtrip(
        existing in arb_range(),
        range in arb_range(),
        prot in arb_prot(),
        tail in 0usize..PAGE_SIZE,
    ) {
        let mut pool = FramePool::heap(POOL_PAGES);
        let mut space = AddressSpace::new();
        space.map_region(existing.0 * PAGE_SIZE, existing.1 * PAGE_SIZE, RW, &mut pool).unwrap();
        let start = range.0 * PAGE_SIZE;
        let len = range.1 * PAGE_SIZE - tail;
        prop_assume!(
            (start..start + len).step_by(PAGE_SIZE).all(|va| space.translate(va).is_err())
        );

        let before = snapshot(&space);
        let free_before = pool.available();
        space.map_region(start, len, prot, &mut pool).unwrap();
        space.unmap_region(start, len, &mut pool).unwrap();
        prop_assert_eq!(snapshot(&space), before);
        prop_assert_eq!(pool.available(), free_before);
    }

    #[test]
    fn overlapping_map_is_rejected(
        existing in arb_range(),
        offset in 0usize..8,
        back in 0usize..4,
        extra in 0usize..4,
        prot in arb_prot(),
    ) {
        let mut pool = FramePool::heap(POOL_PAGES);
        let mut space = AddressSpace::new();
        space.map_region(existing.0 * PAGE_SIZE, existing.1 * PAGE_SIZE, RW, &mut pool).unwrap();
        let hit = existing.0 + offset % existing.1;
        let start = hit - back.min(hit);
        let pages = hit - start + 1 + extra;

        let before = snapshot(&space);
        let free_before = pool.available();
        prop_assert_eq!(
            space.map_region(start * PAGE_SIZE, pages * PAGE_SIZE, prot, &mut pool),
            Err(VmError::AlreadyMapped)
        );
        prop_assert_eq!(snapshot(&space), before);
        prop_assert_eq!(pool.available(), free_before);
    }

    #[test]
    fn unmap_with_hole_is_rejected(existing in arb_range(), range in arb_range()) {
        let mut pool = FramePool::heap(POOL_PAGES);
        let mut space = AddressSpace::new();
        space.map_region(existing.0 * PAGE_SIZE, existing.1 * PAGE_SIZE, RW, &mut pool).unwrap();
        let (start, end) = (range.0, range.0 + range.1);
        prop_assume!(start < existing.0 || end > existing.0 + existing.1);

        let before = snapshot(&space);
        let in_use = pool.in_use();
        prop_assert_eq!(
            space.unmap_region(start * PAGE_SIZE, range.1 * PAGE_SIZE, &mut pool),
            Err(VmError::Unmapped)
        );
        prop_assert_eq!(snapshot(&space), before);
        prop_assert_eq!(pool.in_use(), in_use);
    }
}
