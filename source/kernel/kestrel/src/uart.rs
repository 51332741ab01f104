// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! 16550 UART on the QEMU `virt` machine: console I/O and boot diagnostics.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::hal::Console;

/// Address of the first UART on the `virt` machine.
const UART0_BASE: usize = 0x1000_0000;
const UART_RX: usize = 0x0;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_DATA_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

/// Global UART writer used for kernel logs.
static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

/// UART implementation capable of formatted writes and polled reads.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Creates a UART abstraction rooted at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the boot UART singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    /// Blocks until the transmitter is idle, then sends `byte`.
    pub fn write_byte(&self, byte: u8) {
        // SAFETY: `base` names the memory-mapped 16550 registers on the virt machine.
        unsafe {
            while core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {
            }
            core::ptr::write_volatile((self.base + UART_TX) as *mut u8, byte);
        }
    }

    /// Returns the next received byte, if one is pending.
    pub fn read_byte(&self) -> Option<u8> {
        // SAFETY: see `write_byte`.
        unsafe {
            if core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_DATA_READY == 0 {
                return None;
            }
            Some(core::ptr::read_volatile((self.base + UART_RX) as *const u8))
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Console handed to the syscall layer; user bytes bypass the log mutex.
#[derive(Clone, Copy)]
pub struct UartConsole {
    uart: KernelUart,
}

impl UartConsole {
    pub const fn new() -> Self {
        Self { uart: KernelUart::new(UART0_BASE) }
    }
}

impl Default for UartConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for UartConsole {
    fn put_char(&mut self, byte: u8) {
        self.uart.write_byte(byte);
    }

    fn get_char(&mut self) -> u8 {
        loop {
            if let Some(byte) = self.uart.read_byte() {
                return byte;
            }
            core::hint::spin_loop();
        }
    }
}

// Lock-free UART emission for panic contexts where the mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        KernelUart::new(UART0_BASE).write_str(s)
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}

