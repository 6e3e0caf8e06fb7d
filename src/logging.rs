//! Kernel logger
//!
//! Routes the `log` macros to the console as `[LEVEL target] message`.

use log::{LevelFilter, Metadata, Record};

pub struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger and set the level
///
/// Installing twice keeps the first logger and only changes the level.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::debug!("logger installed");
    }
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_reach_console() {
        init(LevelFilter::Warn);
        log::warn!("logging-check {}", 7);
        assert!(crate::console::msgbuf().contains("logging-check 7"));
    }
}
