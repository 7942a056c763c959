//! Module that prints tagged, colored log lines for peers and the simulator.

use color_print::{ceprintln, cprintln};
use std::sync::atomic::{AtomicU8, Ordering};

/// Verbosity threshold, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Function that sets the highest level that will be printed.
pub fn set_level(level: Level) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Function that tells if messages of the given level are printed.
pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

pub fn info(msg: &str) {
    if enabled(Level::Info) {
        cprintln!("<green, bold>[INFO]</green, bold> {}", msg);
    }
}

pub fn debug(msg: &str) {
    if enabled(Level::Debug) {
        cprintln!("<blue, bold>[DEBUG]</blue, bold> {}", msg);
    }
}

pub fn warn(msg: &str) {
    if enabled(Level::Warn) {
        ceprintln!("<yellow, bold>[WARN]</yellow, bold> {}", msg);
    }
}

pub fn error(msg: &str) {
    if enabled(Level::Error) {
        ceprintln!("<red, bold>[ERROR]</red, bold> {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Info < Level::Debug);
        // default threshold
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Warn));
    }
}
