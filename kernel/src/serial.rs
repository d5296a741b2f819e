//! Kernel console over the COM1 serial port
//!
//! All kernel text output goes through here. On the host the writer is a
//! sink so the portable subsystems can log freely under the test harness.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod port {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref COM1: Mutex<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 I/O port base.
            let mut port = unsafe { SerialPort::new(0x3F8) };
            port.init();
            Mutex::new(port)
        };
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use core::fmt::Write;
        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            let _ = port::COM1.lock().write_fmt(args);
        });
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = args;
    }
}

/// Emit a single byte on the console. Backs the debug putchar operation.
pub fn putchar(byte: u8) {
    print!("{}", byte as char);
}
