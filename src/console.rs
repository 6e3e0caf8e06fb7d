//! Console output for the Kestrel kernel
//!
//! Everything the kernel prints lands in a message buffer that keeps the
//! most recent output. A board layer may install a sink (UART, framebuffer)
//! that additionally receives each string as it is printed.

use alloc::string::String;
use core::fmt::{self, Write};
use heapless::HistoryBuffer;
use spin::Mutex;

/// Message buffer size
pub const MSGBUF_SIZE: usize = 4096;

/// Output hook of the board layer
pub type Sink = fn(&str);

/// Console writer
pub struct Console {
    msgbuf: HistoryBuffer<u8, MSGBUF_SIZE>,
    sink: Option<Sink>,
}

impl Console {
    pub const fn new() -> Self {
        Console {
            msgbuf: HistoryBuffer::new(),
            sink: None,
        }
    }

    pub fn write_str(&mut self, s: &str) {
        self.msgbuf.extend_from_slice(s.as_bytes());
        if let Some(sink) = self.sink {
            sink(s);
        }
    }

    /// Buffered output, oldest first
    pub fn contents(&self) -> String {
        let bytes: alloc::vec::Vec<u8> = self.msgbuf.oldest_ordered().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn clear(&mut self) {
        self.msgbuf.clear();
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Install the board output hook
pub fn set_sink(sink: Option<Sink>) {
    CONSOLE.lock().sink = sink;
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Current message buffer
pub fn msgbuf() -> String {
    CONSOLE.lock().contents()
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
