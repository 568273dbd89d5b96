use chrono::Local;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Turns `debug!` traces on or off for the whole process.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn debug(args: fmt::Arguments) {
    println!("[{}] DEBUG redagg {}", Local::now().format(TIME_FORMAT), args);
}

pub fn info(args: fmt::Arguments) {
    println!("[{}] INFO  redagg {}", Local::now().format(TIME_FORMAT), args);
}

pub fn warn(args: fmt::Arguments) {
    eprintln!("[{}] WARN  redagg {}", Local::now().format(TIME_FORMAT), args);
}

pub fn error(args: fmt::Arguments) {
    eprintln!("[{}] ERROR redagg {}", Local::now().format(TIME_FORMAT), args);
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::logger::debug_enabled() {
            $crate::logger::debug(format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::error(format_args!($($arg)*))
    };
}
