//! Bounded circular log buffer with level filtering.
//!
//! Boot/entry assembly, the framebuffer blitter, and the terminal line
//! editor are external collaborators to this kernel core; they consume
//! only `log(level, subsystem, fmt, args)` through the [`log!`] macro and a
//! timer tick advancing [`Logger::uptime_ticks`]. This crate owns the ring
//! buffer and the level filter, nothing more.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::{String, ToString};
use spin::Mutex;

/// Total capacity of the ring, matching the wire format's 16 KiB budget.
pub const RING_CAPACITY_BYTES: usize = 16 * 1024;

pub const MAX_SUBSYSTEM_LEN: usize = 255;
pub const MAX_MESSAGE_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// One record in the ring: 8-byte timestamp, 1-byte level, subsystem name
/// (length-prefixed, 255 bytes max), message (length-prefixed, 255 bytes
/// max) — see spec §6 "Log entry wire format".
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: u64,
    pub level: Level,
    pub subsystem: String,
    pub message: String,
}

impl LogEntry {
    /// Encode into the fixed wire layout. Truncates subsystem/message to
    /// their 255-byte caps rather than erroring — logging must never be
    /// the thing that fails.
    pub fn to_bytes(&self) -> [u8; 8 + 1 + 1 + MAX_SUBSYSTEM_LEN + 1 + MAX_MESSAGE_LEN] {
        let mut out = [0u8; 8 + 1 + 1 + MAX_SUBSYSTEM_LEN + 1 + MAX_MESSAGE_LEN];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8] = self.level as u8;

        let sub_bytes = self.subsystem.as_bytes();
        let sub_len = sub_bytes.len().min(MAX_SUBSYSTEM_LEN);
        out[9] = sub_len as u8;
        out[10..10 + sub_len].copy_from_slice(&sub_bytes[..sub_len]);

        let msg_offset = 10 + MAX_SUBSYSTEM_LEN;
        let msg_bytes = self.message.as_bytes();
        let msg_len = msg_bytes.len().min(MAX_MESSAGE_LEN);
        out[msg_offset] = msg_len as u8;
        out[msg_offset + 1..msg_offset + 1 + msg_len].copy_from_slice(&msg_bytes[..msg_len]);

        out
    }
}

struct Ring {
    entries: alloc::collections::VecDeque<LogEntry>,
    byte_budget: usize,
    used_bytes: usize,
    min_level: Level,
    uptime_ticks: u64,
}

impl Ring {
    const fn new() -> Self {
        Ring {
            entries: alloc::collections::VecDeque::new(),
            byte_budget: RING_CAPACITY_BYTES,
            used_bytes: 0,
            min_level: Level::Debug,
            uptime_ticks: 0,
        }
    }

    fn entry_cost(entry: &LogEntry) -> usize {
        10 + entry.subsystem.len().min(MAX_SUBSYSTEM_LEN)
            + 1
            + entry.message.len().min(MAX_MESSAGE_LEN)
    }

    fn push(&mut self, entry: LogEntry) {
        let cost = Self::entry_cost(&entry);
        while self.used_bytes + cost > self.byte_budget {
            match self.entries.pop_front() {
                Some(evicted) => self.used_bytes -= Self::entry_cost(&evicted),
                None => break,
            }
        }
        self.used_bytes += cost;
        self.entries.push_back(entry);
    }
}

/// Global log sink. A single instance per kernel, matching the teacher's
/// single `static SERIAL1: Mutex<SerialPort>` pattern.
pub struct Logger {
    ring: Mutex<Ring>,
}

impl Logger {
    pub const fn new() -> Self {
        Logger {
            ring: Mutex::new(Ring::new()),
        }
    }

    pub fn set_min_level(&self, level: Level) {
        self.ring.lock().min_level = level;
    }

    /// Advance uptime by one tick. Called from the timer interrupt in a
    /// real boot; callers in tests advance it manually.
    pub fn tick(&self) {
        self.ring.lock().uptime_ticks += 1;
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.ring.lock().uptime_ticks
    }

    pub fn log(&self, level: Level, subsystem: &str, message: String) {
        let mut ring = self.ring.lock();
        if level < ring.min_level {
            return;
        }
        let timestamp = ring.uptime_ticks;
        ring.push(LogEntry {
            timestamp,
            level,
            subsystem: subsystem.to_string(),
            message,
        });
    }

    /// Snapshot the ring, oldest first. Intended for tests and the
    /// `log` console command; not a hot path.
    pub fn drain(&self) -> alloc::vec::Vec<LogEntry> {
        self.ring.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

#[doc(hidden)]
pub fn _log(level: Level, subsystem: &str, args: core::fmt::Arguments) {
    use alloc::string::ToString;
    LOGGER.log(level, subsystem, args.to_string());
}

/// `log!(Level::Warning, "pmm", "rejected allocation: {} pages", n)`
#[macro_export]
macro_rules! log {
    ($level:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::_log($level, $subsystem, format_args!($($arg)*))
    };
}

pub fn level_str(level: Level) -> &'static str {
    level.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_below_threshold() {
        let logger = Logger::new();
        logger.set_min_level(Level::Warning);
        logger.log(Level::Info, "pmm", "ignored".to_string());
        logger.log(Level::Warning, "pmm", "kept".to_string());
        let drained = logger.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "kept");
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let logger = Logger::new();
        let big_message = "x".repeat(MAX_MESSAGE_LEN);
        let entries_to_fill = RING_CAPACITY_BYTES / (10 + big_message.len()) + 2;
        for i in 0..entries_to_fill {
            logger.log(Level::Info, "test", alloc::format!("{i}{big_message}"));
        }
        let drained = logger.drain();
        // the buffer never grows past its byte budget
        let used: usize = drained
            .iter()
            .map(|e| 10 + e.subsystem.len() + 1 + e.message.len())
            .sum();
        assert!(used <= RING_CAPACITY_BYTES);
        // oldest entries were evicted, so entry 0 should be gone
        assert!(!drained.iter().any(|e| e.message.starts_with('0')));
    }

    #[test]
    fn wire_format_round_trip_header() {
        let logger = Logger::new();
        logger.log(Level::Error, "vmm", "boom".to_string());
        let entry = &logger.drain()[0];
        let bytes = entry.to_bytes();
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 0);
        assert_eq!(bytes[8], Level::Error as u8);
        assert_eq!(bytes[9] as usize, "vmm".len());
    }

    #[test]
    fn tick_advances_monotonically() {
        let logger = Logger::new();
        let before = logger.uptime_ticks();
        logger.tick();
        logger.tick();
        assert_eq!(logger.uptime_ticks(), before + 2);
    }
}
