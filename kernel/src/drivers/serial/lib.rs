// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides access to serial ports and implements the `print` and `println` macros.
//!
//! This module provides functionality to write text to a serial port device. Each
//! of the four devices is provided ([`COM1`], [`COM2`], [`COM3`], and [`COM4`]),
//! protected with a spin lock.
//!
//! This module also implements the [`print`] and [`println`] macros, both of which
//! write their output to [`COM1`].
//!
//! # Examples
//!
//! ```
//! println!("This is written to serial port COM{}!", 1);
//! ```
//!
//! # Safety
//!
//! The [`print`] and [`println`] macros both disable interrupts while running, to
//! prevent deadlocks when locking [`COM1`]. Direct access to the individual serial
//! ports without disabling interrupts could lead to deadlocks.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![allow(unsafe_code)]
#![deny(unused_crate_dependencies)]

mod port;

use core::fmt;
use core::fmt::Write;
use interrupts::without_interrupts;
use port::Port;
use spin::Mutex;

/// Offsets of the 16550 UART's registers from the port base, as
/// reflected in the original implementation's `SerialAddress` and
/// `PortOffset` enumerations.
///
const OFFSET_DATA: u16 = 0;
const OFFSET_INTERRUPT_ENABLE: u16 = 1;
const OFFSET_FIFO_CONTROL: u16 = 2;
const OFFSET_LINE_CONTROL: u16 = 3;
const OFFSET_MODEM_CONTROL: u16 = 4;
const OFFSET_LINE_STATUS: u16 = 5;

/// A single 16550-compatible UART, addressed at a fixed base port.
///
pub struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    /// Returns a `SerialPort` for the UART at `base`, without
    /// initialising the hardware.
    ///
    /// # Safety
    ///
    /// The caller must ensure `base` really addresses a UART, and
    /// that no other code accesses the same ports concurrently
    /// without synchronisation.
    ///
    pub const unsafe fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base + OFFSET_DATA),
            interrupt_enable: Port::new(base + OFFSET_INTERRUPT_ENABLE),
            fifo_control: Port::new(base + OFFSET_FIFO_CONTROL),
            line_control: Port::new(base + OFFSET_LINE_CONTROL),
            modem_control: Port::new(base + OFFSET_MODEM_CONTROL),
            line_status: Port::new(base + OFFSET_LINE_STATUS),
        }
    }

    /// Programs the UART into 38400 baud, 8 data bits, no parity, one
    /// stop bit, with the FIFO enabled and interrupts disabled.
    ///
    pub fn init(&mut self) {
        unsafe {
            // Disable interrupts from the UART itself; the kernel
            // polls the line status register instead.
            self.interrupt_enable.write(0x00);

            // Set the divisor latch access bit to program the baud
            // rate divisor (3 => 38400 baud from the 115200 base
            // clock).
            self.line_control.write(0x80);
            self.data.write(0x03);
            self.interrupt_enable.write(0x00);

            // 8 data bits, no parity, one stop bit; clears the
            // divisor latch access bit set above.
            self.line_control.write(0x03);

            // Enable the FIFO, clear it, with a 14-byte threshold.
            self.fifo_control.write(0xc7);

            // Mark the data terminal and request-to-send lines ready,
            // and enable auxiliary output 2, used on real hardware as
            // the UART's interrupt line.
            self.modem_control.write(0x0b);
        }
    }

    fn line_status(&self) -> u8 {
        unsafe { self.line_status.read() }
    }

    /// Blocks until the transmit buffer is empty.
    ///
    pub fn flush(&self) {
        while self.line_status() & 0x20 == 0 {}
    }

    /// Writes a single byte, blocking until the transmit buffer has
    /// room for it.
    ///
    pub fn write_byte(&mut self, byte: u8) {
        self.flush();
        unsafe {
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// COM1 is the first serial port device.
///
pub static COM1: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3f8)) };

/// COM2 is the second serial port device.
///
pub static COM2: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x2f8)) };

/// COM3 is the third serial port device.
///
pub static COM3: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x3e8)) };

/// COM4 is the fourth serial port device.
///
pub static COM4: Mutex<SerialPort> = unsafe { Mutex::new(SerialPort::new(0x2e8)) };

/// Initialises all four serial ports.
///
/// Must be called exactly once, before [`print`] or [`println`] are
/// used.
///
pub fn init() {
    without_interrupts(|| {
        COM1.lock().init();
        COM2.lock().init();
        COM3.lock().init();
        COM4.lock().init();
    });
}

/// Write a string to the first serial port,
/// COM1.
///
pub fn write_str(s: &str) -> core::fmt::Result {
    without_interrupts(|| COM1.lock().write_str(s))
}

/// _print writes text to the serial port by
/// acquiring COM1 using a spin lock.
///
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    without_interrupts(|| {
        COM1.lock()
            .write_fmt(args)
            .expect("Printing to COM1 failed");
    });
}

/// Print to the first serial port, COM1.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Print to the first serial port, COM1.
///
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
