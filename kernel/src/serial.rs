//! Serial console backend. The teacher's `src/serial.rs` pairs exactly
//! this `uart_16550::SerialPort` + `lazy_static` + `spin::Mutex` trio with
//! a `print!`/`println!` macro pair; kept as-is here since the pixel
//! framebuffer path needs a font asset this workspace doesn't carry, so
//! serial is the kernel's actual boot console and the backend
//! `talon_console::execute`'s `write_line` callback writes to.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    SERIAL1.lock().write_fmt(args).expect("printing to serial failed");
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($fmt:expr) => ($crate::print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::print!(concat!($fmt, "\n"), $($arg)*));
}
