// Kernel console on uart0. Output masks interrupts for the duration of one
// formatted write so messages from ISRs do not interleave.

use core::fmt::{self, Write};

use alloc::sync::Arc;

use crate::error::Result;
use crate::intr::{disable_interrupts, restore_interrupts};
use crate::thread::running_thread_yield;
use crate::uart::{uart_getc, uart_init, uart_putc};
use crate::uio::Uio;

pub struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                uart_putc(b'\r');
            }
            uart_putc(b);
        }
        Ok(())
    }
}

pub fn console_init() {
    uart_init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let pie = disable_interrupts();
    let _ = Console.write_fmt(args);
    restore_interrupts(pie);
}

/// The endpoint installed at descriptors 0/1/2. Reads poll the UART,
/// yielding between attempts; writes go straight to the console.
pub struct ConsoleUio;

impl ConsoleUio {
    pub fn open() -> Arc<dyn Uio> {
        Arc::new(ConsoleUio)
    }
}

impl Uio for ConsoleUio {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let c = loop {
            match uart_getc() {
                Some(c) => break c,
                None => running_thread_yield(),
            }
        };
        buf[0] = if c == b'\r' { b'\n' } else { c };
        Ok(1)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let pie = disable_interrupts();
        for &b in buf {
            if b == b'\n' {
                uart_putc(b'\r');
            }
            uart_putc(b);
        }
        restore_interrupts(pie);
        Ok(buf.len())
    }
}
