//! Serial console output.
//!
//! `uart_16550` drives port `0x3F8` directly so the byte-banging logic isn't hand-maintained, and
//! is exposed behind [`ConsoleOut`] (one of the [`crate::collab`] external-collaborator contracts)
//! so the rest of the crate never depends on a concrete console.

use core::fmt;

use spin::Mutex;

/// Something a `printk!` call can write formatted text to.
pub trait ConsoleOut {
    /// Write raw bytes to the console. Implementations should not buffer.
    fn write_bytes(&mut self, bytes: &[u8]);
}

#[cfg(not(test))]
mod serial {
    use spin::Mutex;
    use uart_16550::SerialPort;

    use super::ConsoleOut;

    /// COM1, the conventional first serial port on a PC-compatible machine.
    const COM1: u16 = 0x3F8;

    pub struct Serial(SerialPort);

    impl Serial {
        /// # Safety
        /// Must be called at most once; `port` must not otherwise be touched.
        pub unsafe fn new() -> Self {
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            Serial(port)
        }
    }

    impl ConsoleOut for Serial {
        fn write_bytes(&mut self, bytes: &[u8]) {
            for b in bytes {
                self.0.send(*b);
            }
        }
    }

    pub static CONSOLE: Mutex<Option<Serial>> = Mutex::new(None);

    /// Bring up the serial console. Must run before the first `printk!`.
    pub fn init() {
        *CONSOLE.lock() = Some(unsafe { Serial::new() });
    }
}

#[cfg(not(test))]
pub use serial::{init, CONSOLE};

/// An in-memory console used by the test suite: `printk!` still runs in every unit test, it just
/// writes into a buffer instead of a real UART.
#[cfg(test)]
pub static CONSOLE: Mutex<Option<alloc::vec::Vec<u8>>> = Mutex::new(None);

#[cfg(test)]
impl ConsoleOut for alloc::vec::Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

#[cfg(test)]
pub fn init() {
    *CONSOLE.lock() = Some(alloc::vec::Vec::new());
}

/// Adapter so `write!`/`writeln!` can target whichever [`ConsoleOut`] is active.
pub struct Writer<'a, T: ConsoleOut>(pub &'a mut T);

impl<'a, T: ConsoleOut> fmt::Write for Writer<'a, T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Print a formatted message to the console, initializing it lazily if needed.
///
/// A macro (rather than a function) so the format string is only evaluated when a console
/// actually exists.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => ({
        use core::fmt::Write as _;
        let mut guard = $crate::console::CONSOLE.lock();
        if guard.is_none() {
            drop(guard);
            $crate::console::init();
            guard = $crate::console::CONSOLE.lock();
        }
        if let Some(console) = guard.as_mut() {
            let _ = write!($crate::console::Writer(console), $($arg)*);
        }
    })
}
