// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cycle counter conversions for accounting and `gettimeofday`
//! OWNERS: @kernel-team
//! PUBLIC API: TimeVal, cycles_to_ticks(), cycles_to_millis(), cycles_to_timeval()
//! DEPENDS_ON: config::{CPU_FREQ, TICKS_PER_SEC}
//! INVARIANTS: Pure integer arithmetic; no calibration or drift correction

use static_assertions::const_assert_eq;

use crate::config::{CPU_FREQ, TICKS_PER_SEC};

const MICROS_PER_SEC: u64 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// Wall-clock value written verbatim to user memory by `gettimeofday`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: u64,
    pub usec: u64,
}

const_assert_eq!(core::mem::size_of::<TimeVal>(), 16);

impl TimeVal {
    /// Raw little-endian bytes as user space sees the structure.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.sec.to_le_bytes());
        out[8..].copy_from_slice(&self.usec.to_le_bytes());
        out
    }
}

#[inline]
pub const fn cycles_to_ticks(cycles: u64) -> u64 {
    mul_div(cycles, TICKS_PER_SEC, CPU_FREQ)
}

#[inline]
pub const fn cycles_to_millis(cycles: u64) -> u64 {
    mul_div(cycles, MILLIS_PER_SEC, CPU_FREQ)
}

/// Splits a cycle count into whole seconds and the microsecond remainder.
#[inline]
pub const fn cycles_to_timeval(cycles: u64) -> TimeVal {
    TimeVal {
        sec: cycles / CPU_FREQ,
        usec: (cycles % CPU_FREQ) * MICROS_PER_SEC / CPU_FREQ,
    }
}

// Widened so long uptimes cannot overflow the intermediate product.
#[inline]
const fn mul_div(value: u64, mul: u64, div: u64) -> u64 {
    ((value as u128 * mul as u128) / div as u128) as u64
}
