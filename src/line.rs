//! Open-drain line control.
//!
//! An I2C line is never driven high. It is either held low by an output
//! driver or released, in which case a pull-up takes it high unless another
//! device on the bus keeps it low. The [`Line`] trait captures exactly those
//! two intents plus sampling the observed level, and is all the protocol
//! engine needs from the hardware.
//!
//! Two adapters are provided:
//! - [`OpenDrain`] for `embedded-hal` pins already configured as open-drain
//!   outputs.
//! - [`PortLine`], obtained from a [`PortBinding`], for ports that expose a
//!   direction register, an output register and an input register (AVR
//!   `DDRx`/`PORTx`/`PINx` style).

use core::convert::Infallible;
use core::fmt;

use embedded_hal::digital::v2::{InputPin, OutputPin};

/// A single open-drain bus line
pub trait Line {
    /// Error raised by the underlying pin
    type Error;

    /// Actively drive the line low
    fn hold_low(&mut self) -> Result<(), Self::Error>;

    /// Stop driving the line and let the pull-up take it high
    ///
    /// This does not wait for the line to actually rise; on the clock line
    /// the engine polls [`Line::is_high`] afterwards to honor clock stretching.
    fn release(&mut self) -> Result<(), Self::Error>;

    /// Sample the level currently observed on the line
    fn is_high(&mut self) -> Result<bool, Self::Error>;
}

/// Line backed by an `embedded-hal` pin in open-drain mode
///
/// Setting an open-drain pin high turns its driver off, which is the
/// release operation.
pub struct OpenDrain<P> {
    pin: P,
}

impl<P, E> OpenDrain<P>
where
    P: OutputPin<Error = E> + InputPin<Error = E>,
{
    /// Wrap a pin that is already configured as an open-drain output
    pub fn new(pin: P) -> Self {
        OpenDrain { pin }
    }

    /// Give the pin back
    pub fn free(self) -> P {
        self.pin
    }
}

impl<P, E> Line for OpenDrain<P>
where
    P: OutputPin<Error = E> + InputPin<Error = E>,
{
    type Error = E;

    #[inline]
    fn hold_low(&mut self) -> Result<(), E> {
        self.pin.set_low()
    }

    #[inline]
    fn release(&mut self) -> Result<(), E> {
        self.pin.set_high()
    }

    #[inline]
    fn is_high(&mut self) -> Result<bool, E> {
        self.pin.is_high()
    }
}

/// An 8-bit hardware register
pub trait Register {
    /// Read the current register value
    fn read(&self) -> u8;

    /// Overwrite the register value
    fn write(&self, value: u8);

    /// Set the bits in `mask`, leaving the others untouched
    #[inline]
    fn set_bits(&self, mask: u8) {
        self.write(self.read() | mask);
    }

    /// Clear the bits in `mask`, leaving the others untouched
    #[inline]
    fn clear_bits(&self, mask: u8) {
        self.write(self.read() & !mask);
    }
}

/// Memory-mapped register accessed with volatile reads and writes
#[derive(Debug, Clone, Copy)]
pub struct Mmio(*mut u8);

impl Mmio {
    /// Create a register handle for `address`
    ///
    /// # Safety
    ///
    /// `address` must be a valid, byte-sized memory-mapped I/O register for
    /// the whole lifetime of the handle and its copies. Read-modify-write
    /// sequences on it are not atomic, so nothing else may modify the
    /// register concurrently (including interrupt handlers).
    pub const unsafe fn new(address: usize) -> Self {
        Mmio(address as *mut u8)
    }
}

impl Register for Mmio {
    #[inline]
    fn read(&self) -> u8 {
        // Safety: validity of the address is guaranteed by `Mmio::new`'s contract
        unsafe { core::ptr::read_volatile(self.0) }
    }

    #[inline]
    fn write(&self, value: u8) {
        // Safety: see `read`
        unsafe { core::ptr::write_volatile(self.0, value) }
    }
}

/// Invalid pin assignment passed to [`PortBinding::new`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// Bit index does not fit an 8-bit port
    BitOutOfRange(u8),
    /// SDA and SCL were assigned the same bit
    SharedBit(u8),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::BitOutOfRange(bit) => write!(f, "bit {} is outside an 8-bit port", bit),
            BindError::SharedBit(bit) => write!(f, "SDA and SCL both assigned to bit {}", bit),
        }
    }
}

/// Binding of the two bus lines to one I/O port
///
/// Holds the direction, output and input registers of the port and the bit
/// position of each line. The binding is consumed by [`PortBinding::split`],
/// so a given set of pins can only be bound once at a time.
pub struct PortBinding<R> {
    ddr: R,
    port: R,
    pin: R,
    sda: u8,
    scl: u8,
}

impl<R> PortBinding<R>
where
    R: Register + Clone,
{
    /// Bind SDA and SCL to bits `sda` and `scl` of a port
    pub fn new(ddr: R, port: R, pin: R, sda: u8, scl: u8) -> Result<Self, BindError> {
        if sda > 7 {
            return Err(BindError::BitOutOfRange(sda));
        }
        if scl > 7 {
            return Err(BindError::BitOutOfRange(scl));
        }
        if sda == scl {
            return Err(BindError::SharedBit(sda));
        }

        Ok(PortBinding {
            ddr,
            port,
            pin,
            sda,
            scl,
        })
    }

    /// Split the binding into its `(sda, scl)` lines
    pub fn split(self) -> (PortLine<R>, PortLine<R>) {
        let sda = PortLine {
            ddr: self.ddr.clone(),
            port: self.port.clone(),
            pin: self.pin.clone(),
            mask: 1 << self.sda,
        };
        let scl = PortLine {
            ddr: self.ddr,
            port: self.port,
            pin: self.pin,
            mask: 1 << self.scl,
        };
        (sda, scl)
    }
}

/// One line of a [`PortBinding`]
pub struct PortLine<R> {
    ddr: R,
    port: R,
    pin: R,
    mask: u8,
}

impl<R: Register> Line for PortLine<R> {
    type Error = Infallible;

    #[inline]
    fn hold_low(&mut self) -> Result<(), Infallible> {
        self.ddr.set_bits(self.mask);
        self.port.clear_bits(self.mask);
        Ok(())
    }

    // Switching to input with the output bit set enables the internal pull-up.
    #[inline]
    fn release(&mut self) -> Result<(), Infallible> {
        self.ddr.clear_bits(self.mask);
        self.port.set_bits(self.mask);
        Ok(())
    }

    #[inline]
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.pin.read() & self.mask != 0)
    }
}
