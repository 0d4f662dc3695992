/*!
  # Bit-banged I2C initiator with clock stretching

  This implementation consumes the following hardware resources:
  - A periodic timer to mark quarter-bit intervals
  - Two open-drain lines for SDA and SCL, see [`Line`](crate::line::Line).

  Lines are only ever held low or released. After releasing SCL the driver
  waits until the line is observed high, so a slow peripheral can stretch
  the clock. That wait is unbounded unless
  [`Config::stretch_limit`](crate::config::Config) is set.

  ## Hardware requirements

  1. Configure GPIO pins as open-drain outputs (or bind a port with
     [`PortBinding`](crate::line::PortBinding)), with pull-ups on both lines.
  2. Configure the timer to tick at 400 kHz. One tick is the 2.5 µs half
     delay, two ticks the 5 µs full delay; a complete bit takes four ticks,
     which keeps the bus at or below the 100 kHz standard-mode clock.

  ## AVR example

  Here is a sample transaction with a peripheral at address `0x20` whose
  lines sit on bits 6 (SDA) and 4 (SCL) of port A:

  ```ignore
    use bitbang_i2c_initiator::i2c::I2cBB;
    use bitbang_i2c_initiator::line::{Mmio, PortBinding};

    // DDRA, PORTA and PINA on an ATtiny84
    let (ddr, port, pin) = unsafe { (Mmio::new(0x3a), Mmio::new(0x3b), Mmio::new(0x39)) };
    let (sda, scl) = PortBinding::new(ddr, port, pin, 6, 4).unwrap().split();

    let mut i2c = I2cBB::new(scl, sda, timer_400khz);
    i2c.idle().unwrap();

    i2c.write_register(0x20, 0x00, &[5]).unwrap();

    let mut value = [0];
    i2c.read_register(0x20, 0x00, &mut value).unwrap();
  ```
*/

use core::fmt;

use embedded_hal::blocking::i2c::{Read, Write, WriteRead};
use embedded_hal::timer::{CountDown, Periodic};
use nb::block;

use crate::config::Config;
use crate::line::Line;

/// I2C error
#[derive(Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// GPIO error
    Bus(E),
    /// No ack received
    NoAck,
    /// SCL was still held low after the configured number of polls
    StretchTimeout,
    /// Invalid input
    InvalidData,
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "line error: {:?}", e),
            Error::NoAck => f.write_str("byte not acknowledged"),
            Error::StretchTimeout => f.write_str("clock held low by peripheral"),
            Error::InvalidData => f.write_str("invalid input"),
        }
    }
}

/// Where the driver is within a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// No transaction in progress (stop condition sent, or never started)
    Idle,
    /// Start condition sent
    Started,
    /// Last transfer was a byte written by the initiator
    Writing,
    /// Last transfer was a byte read from the peripheral
    Reading,
}

/// Bit banging I2C initiator
pub struct I2cBB<SCL, SDA, CLK>
where
    SCL: Line,
    SDA: Line,
    CLK: CountDown + Periodic,
{
    scl: SCL,
    sda: SDA,
    clk: CLK,
    config: Config,
    state: BusState,
}

impl<SCL, SDA, CLK, E> I2cBB<SCL, SDA, CLK>
where
    SCL: Line<Error = E>,
    SDA: Line<Error = E>,
    CLK: CountDown + Periodic,
{
    /// Create instance with the default [`Config`]
    pub fn new(scl: SCL, sda: SDA, clk: CLK) -> Self {
        Self::with_config(scl, sda, clk, Config::default())
    }

    /// Create instance with an explicit [`Config`]
    pub fn with_config(scl: SCL, sda: SDA, clk: CLK, config: Config) -> Self {
        I2cBB {
            scl,
            sda,
            clk,
            config,
            state: BusState::Idle,
        }
    }

    /// Release the lines and timer
    pub fn free(self) -> (SCL, SDA, CLK) {
        (self.scl, self.sda, self.clk)
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current position in the transaction state machine
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Release both lines, leaving the bus idle
    ///
    /// Call once after binding the lines, before the first transaction.
    pub fn idle(&mut self) -> Result<(), Error<E>> {
        self.release_sda()?;
        self.release_scl()?;
        self.state = BusState::Idle;
        Ok(())
    }

    /// Send a start (or repeated start) condition
    ///
    /// SDA falls while SCL is high, then SCL is pulled low ready for the
    /// first bit.
    pub fn start(&mut self) -> Result<(), Error<E>> {
        self.release_sda()?;
        self.release_scl()?;
        self.full_delay();

        self.hold_sda()?;
        self.full_delay();

        self.hold_scl()?;
        self.state = BusState::Started;
        Ok(())
    }

    /// Send a stop condition
    ///
    /// SDA rises while SCL is high, after which both lines are released.
    pub fn stop(&mut self) -> Result<(), Error<E>> {
        self.hold_sda()?;
        self.release_scl()?;
        self.full_delay();

        self.release_sda()?;
        self.state = BusState::Idle;
        Ok(())
    }

    /// Write one byte MSB-first and check the acknowledgment
    ///
    /// On [`Error::NoAck`] both lines are left released and no stop
    /// condition is sent; that decision belongs to the caller.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), Error<E>> {
        self.state = BusState::Writing;

        for bit_offset in 0..8 {
            let out_bit = (byte >> (7 - bit_offset)) & 0b1;

            if out_bit == 1 {
                self.release_sda()?;
            } else {
                self.hold_sda()?;
            }

            self.pulse_scl()?;
        }

        // ACK slot: the receiver pulls SDA low while SCL is high
        self.release_sda()?;
        self.release_scl()?;
        self.full_delay();

        if self.sda.is_high().map_err(Error::Bus)? {
            return Err(Error::NoAck);
        }

        self.hold_scl()?;
        self.hold_sda()?;
        self.full_delay();

        Ok(())
    }

    /// Read one byte MSB-first, then acknowledge it
    ///
    /// With `last` set the byte is answered with a NACK, telling the
    /// peripheral to stop sending; otherwise it is ACKed.
    pub fn read_byte(&mut self, last: bool) -> Result<u8, Error<E>> {
        let mut byte: u8 = 0;
        self.state = BusState::Reading;

        self.release_sda()?;
        self.full_delay();

        for bit_offset in 0..8 {
            self.release_scl()?;

            // sample in the middle of the high phase
            self.half_delay();
            if self.sda.is_high().map_err(Error::Bus)? {
                byte |= 1 << (7 - bit_offset);
            }
            self.half_delay();

            self.hold_scl()?;
            self.full_delay();
        }

        if last {
            self.release_sda()?;
            self.pulse_scl()?;
        } else {
            self.hold_sda()?;
            self.pulse_scl()?;
            self.release_sda()?;
        }

        Ok(byte)
    }

    /// Write `data` to consecutive registers of a peripheral, starting at `register`
    ///
    /// Sends start, the address with the write bit, the register address,
    /// every data byte and a stop condition. The first unacknowledged byte
    /// aborts the transfer with [`Error::NoAck`]; unless
    /// [`Config::stop_on_nack`] is set, no stop condition is sent in that case.
    pub fn write_register(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), Error<E>> {
        Self::check_address(address)?;
        log::trace!(
            "i2c write {:#04x} reg {:#04x}, {} byte(s)",
            address,
            register,
            data.len()
        );

        let result = self.write_register_inner(address, register, data);
        self.finish(result)
    }

    fn write_register_inner(&mut self, address: u8, register: u8, data: &[u8]) -> Result<(), Error<E>> {
        // ST
        self.start()?;

        // SAD + W
        self.write_byte(address << 1).map_err(Self::nack("address"))?;

        // SUB
        self.write_byte(register).map_err(Self::nack("register"))?;

        self.write_to_slave(data)?;

        // SP
        self.stop()
    }

    /// Read `buffer.len()` bytes from consecutive registers, starting at `register`
    ///
    /// Selects the register with a data-less register write, then sends a
    /// fresh start, the address with the read bit, reads the bytes (the last
    /// one NACKed) and sends a stop condition. An empty buffer still
    /// addresses the peripheral, which makes it usable as a presence check.
    ///
    /// Once acknowledged for reading, the peripheral drives the first bit of
    /// its data onto SDA. With an empty buffer no clock is sent to read that
    /// bit, so if it is a 0 the peripheral keeps SDA low and the final stop
    /// condition never appears on the wire, even though this returns `Ok`.
    pub fn read_register(&mut self, address: u8, register: u8, buffer: &mut [u8]) -> Result<(), Error<E>> {
        Self::check_address(address)?;
        log::trace!(
            "i2c read {:#04x} reg {:#04x}, {} byte(s)",
            address,
            register,
            buffer.len()
        );

        let result = self
            .write_register_inner(address, register, &[])
            .and_then(|()| self.read_inner(address, buffer));
        self.finish(result)
    }

    fn write_inner(&mut self, address: u8, output: &[u8]) -> Result<(), Error<E>> {
        // ST
        self.start()?;

        // SAD + W
        self.write_byte(address << 1).map_err(Self::nack("address"))?;

        self.write_to_slave(output)?;

        // SP
        self.stop()
    }

    fn write_read_inner(&mut self, address: u8, output: &[u8], input: &mut [u8]) -> Result<(), Error<E>> {
        // ST
        self.start()?;

        // SAD + W
        self.write_byte(address << 1).map_err(Self::nack("address"))?;

        self.write_to_slave(output)?;

        // SR, SAD + R, data, SP
        self.read_inner(address, input)
    }

    fn read_inner(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), Error<E>> {
        // ST
        self.start()?;

        // SAD + R
        self.write_byte((address << 1) | 0x1).map_err(Self::nack("address"))?;

        self.read_from_slave(buffer)?;

        // SP
        self.stop()
    }

    #[inline]
    fn read_from_slave(&mut self, input: &mut [u8]) -> Result<(), Error<E>> {
        let len = input.len();
        for (i, byte) in input.iter_mut().enumerate() {
            *byte = self.read_byte(i == len - 1)?;
        }
        Ok(())
    }

    #[inline]
    fn write_to_slave(&mut self, output: &[u8]) -> Result<(), Error<E>> {
        for byte in output {
            self.write_byte(*byte).map_err(Self::nack("data"))?;
        }
        Ok(())
    }

    /// Apply the abort policy to the outcome of a transaction
    fn finish(&mut self, result: Result<(), Error<E>>) -> Result<(), Error<E>> {
        match result {
            Err(Error::NoAck) if self.config.stop_on_nack => {
                // SCL is still released after the ACK slot; pull it low first
                // so SDA does not fall while the clock is high
                let stopped = self
                    .hold_scl()
                    .and_then(|()| {
                        self.half_delay();
                        self.stop()
                    });
                match stopped {
                    Err(Error::StretchTimeout) => {
                        log::warn!("i2c: SCL stuck low, stop after NACK not sent")
                    }
                    Err(_) => log::warn!("i2c: line error, stop after NACK not sent"),
                    Ok(()) => {}
                }
                Err(Error::NoAck)
            }
            Err(Error::StretchTimeout) => {
                log::warn!("i2c: SCL stuck low, transaction abandoned");
                Err(Error::StretchTimeout)
            }
            other => other,
        }
    }

    fn check_address(address: u8) -> Result<(), Error<E>> {
        if address > 0x7f {
            Err(Error::InvalidData)
        } else {
            Ok(())
        }
    }

    fn nack(phase: &'static str) -> impl Fn(Error<E>) -> Error<E> {
        move |e| {
            if let Error::NoAck = e {
                log::debug!("i2c: no ack for {} byte", phase);
            }
            e
        }
    }

    fn pulse_scl(&mut self) -> Result<(), Error<E>> {
        self.half_delay();
        self.release_scl()?;
        self.full_delay();
        self.hold_scl()?;
        self.half_delay();
        Ok(())
    }

    /// Release SCL and wait until it reads high, honoring clock stretching
    fn release_scl(&mut self) -> Result<(), Error<E>> {
        self.scl.release().map_err(Error::Bus)?;

        let mut polls: u32 = 0;
        while !self.scl.is_high().map_err(Error::Bus)? {
            if let Some(limit) = self.config.stretch_limit {
                if polls == limit {
                    return Err(Error::StretchTimeout);
                }
                polls += 1;
            }
        }
        Ok(())
    }

    #[inline]
    fn hold_scl(&mut self) -> Result<(), Error<E>> {
        self.scl.hold_low().map_err(Error::Bus)
    }

    #[inline]
    fn release_sda(&mut self) -> Result<(), Error<E>> {
        self.sda.release().map_err(Error::Bus)
    }

    #[inline]
    fn hold_sda(&mut self) -> Result<(), Error<E>> {
        self.sda.hold_low().map_err(Error::Bus)
    }

    #[inline]
    fn wait_for_clk(&mut self) {
        block!(self.clk.wait()).ok();
    }

    #[inline]
    fn half_delay(&mut self) {
        self.wait_for_clk();
    }

    #[inline]
    fn full_delay(&mut self) {
        self.wait_for_clk();
        self.wait_for_clk();
    }
}

impl<SCL, SDA, CLK, E> Write for I2cBB<SCL, SDA, CLK>
where
    SCL: Line<Error = E>,
    SDA: Line<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    /// An empty `output` only addresses the peripheral.
    fn write(&mut self, addr: u8, output: &[u8]) -> Result<(), Self::Error> {
        Self::check_address(addr)?;
        log::trace!("i2c write {:#04x}, {} byte(s)", addr, output.len());

        let result = self.write_inner(addr, output);
        self.finish(result)
    }
}

impl<SCL, SDA, CLK, E> Read for I2cBB<SCL, SDA, CLK>
where
    SCL: Line<Error = E>,
    SDA: Line<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    /// An empty `input` only addresses the peripheral. As with
    /// [`I2cBB::read_register`], a peripheral whose first data bit is 0 then
    /// holds SDA low and masks the stop condition.
    fn read(&mut self, addr: u8, input: &mut [u8]) -> Result<(), Self::Error> {
        Self::check_address(addr)?;
        log::trace!("i2c read {:#04x}, {} byte(s)", addr, input.len());

        let result = self.read_inner(addr, input);
        self.finish(result)
    }
}

impl<SCL, SDA, CLK, E> WriteRead for I2cBB<SCL, SDA, CLK>
where
    SCL: Line<Error = E>,
    SDA: Line<Error = E>,
    CLK: CountDown + Periodic,
{
    type Error = Error<E>;

    fn write_read(&mut self, addr: u8, output: &[u8], input: &mut [u8]) -> Result<(), Self::Error> {
        if output.is_empty() || input.is_empty() {
            return Err(Error::InvalidData);
        }
        Self::check_address(addr)?;
        log::trace!(
            "i2c write_read {:#04x}, {} byte(s) out, {} byte(s) in",
            addr,
            output.len(),
            input.len()
        );

        let result = self.write_read_inner(addr, output, input);
        self.finish(result)
    }
}
