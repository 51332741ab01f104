// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Level gating unit tests
//! PUBLIC API: log_* macros, emit(level,target,args), set_max_level(level)
//! DEPENDS_ON: uart::KernelUart (target), std stderr (unit tests)
//! INVARIANTS: Debug/Trace only in debug builds (Trace also with `trace_syscalls`);
//!             single-line emission; never allocates

use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, Ordering};

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug => cfg!(debug_assertions),
            Level::Trace => cfg!(any(debug_assertions, feature = "trace_syscalls")),
            _ => true,
        }
    }
}

// Most verbose level compiled in for this build; `set_max_level` narrows it.
const DEFAULT_MAX_LEVEL: Level = if cfg!(feature = "trace_syscalls") {
    Level::Trace
} else if cfg!(debug_assertions) {
    Level::Debug
} else {
    Level::Info
};

static MAX_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_MAX_LEVEL as u8);

/// Sets the most verbose level that will be emitted at runtime.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns true if a line at `level` would currently be emitted.
pub fn enabled(level: Level) -> bool {
    level.compiled_in() && level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    sink(level, target, args);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn sink(level: Level, target: &'static str, args: Arguments<'_>) {
    use core::fmt::Write;

    let mut uart = crate::uart::KernelUart::lock();
    let writer = &mut *uart;
    let _ = Write::write_fmt(writer, format_args!("[{} {}] ", level.tag(), target));
    let _ = Write::write_fmt(writer, args);
    let _ = Write::write_char(writer, '\n');
}

#[cfg(all(test, not(all(target_arch = "riscv64", target_os = "none"))))]
fn sink(level: Level, target: &'static str, args: Arguments<'_>) {
    std::eprintln!("[{} {}] {}", level.tag(), target, args);
}

#[cfg(not(any(test, all(target_arch = "riscv64", target_os = "none"))))]
fn sink(level: Level, target: &'static str, args: Arguments<'_>) {
    let _ = (level.tag(), target, args);
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
