// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel main routine responsible for subsystem bring-up.
//!
//! Boot stub contract: `_start` sets `sp` to `__stack_top`, zeroes `.bss` and
//! jumps to `kmain`. Everything between `__stack_top` and `MEMORY_END` becomes
//! the frame pool. User programs are described by `__kestrel_app_count`
//! entries of `__kestrel_apps`, emitted by the image packer.

use alloc::boxed::Box;
use core::ptr::{addr_of, addr_of_mut};

use linked_list_allocator::LockedHeap;

use crate::{
    arch::riscv,
    config::{KERNEL_HEAP_SIZE, MEMORY_END},
    hal::{virt::VirtClock, Clock},
    kernel::Kernel,
    loader::AppLoader,
    mm::FramePool,
    trap,
    types::PhysAddr,
    uart::UartConsole,
};

/// First user program started at boot.
const INIT_PROGRAM: &str = "ch5b_usertest";

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

#[repr(C)]
struct AppEntry {
    name: *const u8,
    name_len: usize,
    image: *const u8,
    image_len: usize,
}

extern "C" {
    static __stack_top: u8;
    static __kestrel_app_count: usize;
    static __kestrel_apps: AppEntry;
}

fn init_heap() {
    // SAFETY: runs once on the boot hart before any allocation; HEAP_SPACE is
    // handed to the allocator and never touched directly again.
    unsafe { HEAP.lock().init(addr_of_mut!(HEAP_SPACE) as *mut u8, KERNEL_HEAP_SIZE) };
}

fn app_table() -> AppLoader {
    let mut loader = AppLoader::new();
    // SAFETY: the packer emits `__kestrel_app_count` contiguous entries whose
    // pointers reference read-only data that lives as long as the kernel.
    let entries = unsafe {
        core::slice::from_raw_parts(addr_of!(__kestrel_apps), __kestrel_app_count)
    };
    for entry in entries {
        // SAFETY: see above.
        let (name, image) = unsafe {
            (
                core::slice::from_raw_parts(entry.name, entry.name_len),
                core::slice::from_raw_parts(entry.image, entry.image_len),
            )
        };
        match core::str::from_utf8(name) {
            Ok(name) => loader.register(name, image),
            Err(_) => log_warn!(target: "boot", "skipping app with non-UTF-8 name"),
        }
    }
    loader
}

#[cfg(feature = "boot_banner")]
fn banner(loader: &AppLoader) {
    log_info!(target: "boot", " _           _             _");
    log_info!(target: "boot", "| | _____  _| |_ _ __ ___ | |");
    log_info!(target: "boot", "| |/ / _ \\/ __| __| '__/ _ \\| |");
    log_info!(target: "boot", "|   <  __/\\__ \\ |_| | |  __/| |");
    log_info!(target: "boot", "|_|\\_\\___||___/\\__|_|  \\___||_|");
    log_info!(target: "boot", "kestrel vers. 0.1.0");
    for name in loader.names() {
        log_info!(target: "boot", "app: {}", name);
    }
}

/// Kernel main invoked after boot assembly completed.
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    init_heap();
    trap::install_trap_vector();

    let free_start = PhysAddr::from_raw(addr_of!(__stack_top) as usize);
    // SAFETY: the linker places nothing above `__stack_top`; RAM up to
    // MEMORY_END is identity mapped while paging is off in S-mode.
    let frames = unsafe { FramePool::from_range(free_start, PhysAddr::from_raw(MEMORY_END)) };
    log_info!(target: "boot", "frame pool: {} pages", frames.available());

    let loader = app_table();
    #[cfg(feature = "boot_banner")]
    banner(&loader);

    let kernel = Box::leak(Box::new(Kernel::new(
        Box::new(frames),
        Box::new(UartConsole::new()),
        Box::new(VirtClock::new()),
        Box::new(loader),
    )));
    // SAFETY: `kernel` is leaked, so it never moves or drops.
    unsafe { trap::register_kernel(kernel as *mut Kernel) };

    match kernel.launch(INIT_PROGRAM) {
        Ok(pid) => log_info!(target: "boot", "launched {} pid={}", INIT_PROGRAM, pid),
        Err(err) => panic!("cannot launch {}: {}", INIT_PROGRAM, err),
    }

    kernel.clock().set_next_trigger();
    riscv::enable_timer_interrupts();
    idle_loop()
}

// Runs on the boot stack as the idle context. The `schedule` borrow stays parked
// in `switch` while a process runs; see `trap::register_kernel`.
fn idle_loop() -> ! {
    let mut drained = false;
    loop {
        let dispatched = trap::with_kernel(|kernel| kernel.schedule()).flatten();
        if dispatched.is_some() {
            drained = false;
            continue;
        }
        if !drained && trap::with_kernel(|kernel| kernel.live_processes()) == Some(0) {
            log_info!(target: "boot", "all processes exited");
            drained = true;
        }
        riscv::wait_for_interrupt();
    }
}
