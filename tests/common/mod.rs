//! Host-side model of an open-drain I2C bus.
//!
//! Both lines are wired-AND with pull-ups: a line reads high only when
//! neither the initiator nor the peripheral holds it low. Every level change
//! is recorded so tests can decode what actually happened on the wires.

#![allow(dead_code)]

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use bitbang_i2c_initiator::{Config, I2cBB, Line};
use embedded_hal::timer::{CountDown, Periodic};
use void::Void;

/// Observed levels of both lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Levels {
    pub scl: bool,
    pub sda: bool,
}

/// Bus activity decoded from a level trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Start,
    Stop,
    Byte { value: u8, ack: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Receiving { bits: u8, byte: u8 },
    AckOut { read: bool },
    Transmitting { bits: u8, byte: u8 },
    AckIn { acked: bool },
}

/// Peripheral with a 256-byte register file and an auto-incrementing pointer
///
/// The first byte written after the address selects the register, further
/// bytes are stored; reads return consecutive registers.
struct Device {
    address: u8,
    registers: [u8; 256],
    pointer: u8,
    phase: Phase,
    byte_index: usize,
    sda_low: bool,
}

impl Device {
    fn new(address: u8) -> Self {
        Device {
            address,
            registers: [0; 256],
            pointer: 0,
            phase: Phase::Idle,
            byte_index: 0,
            sda_low: false,
        }
    }

    fn on_start(&mut self) {
        self.phase = Phase::Receiving { bits: 0, byte: 0 };
        self.byte_index = 0;
        self.sda_low = false;
    }

    fn on_stop(&mut self) {
        self.phase = Phase::Idle;
        self.sda_low = false;
    }

    fn on_scl_rise(&mut self, sda: bool) {
        match self.phase {
            Phase::Receiving { bits, byte } if bits < 8 => {
                self.phase = Phase::Receiving {
                    bits: bits + 1,
                    byte: (byte << 1) | sda as u8,
                };
            }
            Phase::Transmitting { bits, byte } => {
                self.phase = Phase::Transmitting { bits: bits + 1, byte };
            }
            Phase::AckIn { .. } => self.phase = Phase::AckIn { acked: !sda },
            _ => {}
        }
    }

    fn on_scl_fall(&mut self) {
        match self.phase {
            Phase::Receiving { bits: 8, byte } => self.received(byte),
            Phase::AckOut { read } => {
                self.sda_low = false;
                if read {
                    self.load_next();
                } else {
                    self.phase = Phase::Receiving { bits: 0, byte: 0 };
                }
            }
            Phase::Transmitting { bits, byte } if bits < 8 => {
                self.sda_low = byte & (0x80 >> bits) == 0;
            }
            Phase::Transmitting { .. } => {
                self.sda_low = false;
                self.phase = Phase::AckIn { acked: false };
            }
            Phase::AckIn { acked: true } => self.load_next(),
            Phase::AckIn { acked: false } => self.phase = Phase::Idle,
            _ => {}
        }
    }

    fn received(&mut self, byte: u8) {
        let index = self.byte_index;
        self.byte_index += 1;

        match index {
            0 if byte >> 1 != self.address => {
                self.phase = Phase::Idle;
                return;
            }
            0 => {}
            1 => self.pointer = byte,
            _ => {
                self.registers[self.pointer as usize] = byte;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }

        self.sda_low = true;
        self.phase = Phase::AckOut {
            read: index == 0 && byte & 1 == 1,
        };
    }

    fn load_next(&mut self) {
        let byte = self.registers[self.pointer as usize];
        self.pointer = self.pointer.wrapping_add(1);
        self.phase = Phase::Transmitting { bits: 0, byte };
        self.sda_low = byte & 0x80 == 0;
    }
}

struct Bus {
    sda_held: bool,
    scl_held: bool,
    stretch_per_clock: u32,
    stretch_left: u32,
    clock_stuck: bool,
    jam_after: Option<u32>,
    clocks: u32,
    stretch_polls: u64,
    levels: Levels,
    trace: Vec<Levels>,
    ticks: u64,
    device: Option<Device>,
}

impl Bus {
    fn observe(&self) -> Levels {
        let device_sda = self.device.as_ref().map_or(false, |d| d.sda_low);
        Levels {
            scl: !(self.scl_held || self.stretch_left > 0 || self.clock_stuck),
            sda: !(self.sda_held || device_sda),
        }
    }

    fn settle(&mut self) {
        let old = self.levels;
        let new = self.observe();
        if old == new {
            return;
        }
        self.levels = new;
        self.trace.push(new);

        if let Some(device) = self.device.as_mut() {
            if old.scl != new.scl {
                if new.scl {
                    device.on_scl_rise(new.sda);
                } else {
                    device.on_scl_fall();
                }
            } else if new.scl {
                if new.sda {
                    device.on_stop();
                } else {
                    device.on_start();
                }
            }
        }

        // the peripheral only changes SDA while SCL is low
        let reacted = self.observe();
        if reacted != self.levels {
            self.levels = reacted;
            self.trace.push(reacted);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Sda,
    Scl,
}

/// Initiator side of one simulated line
pub struct SimLine {
    bus: Rc<RefCell<Bus>>,
    wire: Wire,
}

impl Line for SimLine {
    type Error = Infallible;

    fn hold_low(&mut self) -> Result<(), Infallible> {
        let mut bus = self.bus.borrow_mut();
        match self.wire {
            Wire::Sda => bus.sda_held = true,
            Wire::Scl => bus.scl_held = true,
        }
        bus.settle();
        Ok(())
    }

    fn release(&mut self) -> Result<(), Infallible> {
        let mut bus = self.bus.borrow_mut();
        match self.wire {
            Wire::Sda => bus.sda_held = false,
            Wire::Scl => {
                if bus.scl_held {
                    bus.stretch_left = bus.stretch_per_clock;
                    bus.clocks += 1;
                    if bus.jam_after.map_or(false, |n| bus.clocks > n) {
                        bus.clock_stuck = true;
                    }
                }
                bus.scl_held = false;
            }
        }
        bus.settle();
        Ok(())
    }

    fn is_high(&mut self) -> Result<bool, Infallible> {
        let mut bus = self.bus.borrow_mut();
        match self.wire {
            Wire::Sda => Ok(bus.levels.sda),
            Wire::Scl => {
                if !bus.levels.scl {
                    bus.stretch_polls += 1;
                }
                let high = bus.levels.scl;
                if bus.stretch_left > 0 {
                    bus.stretch_left -= 1;
                    bus.settle();
                }
                Ok(high)
            }
        }
    }
}

/// Timer counting the 2.5 µs ticks the driver waits for
pub struct SimTimer {
    bus: Rc<RefCell<Bus>>,
}

impl CountDown for SimTimer {
    type Time = u32;

    fn start<T>(&mut self, _count: T)
    where
        T: Into<Self::Time>,
    {
    }

    fn wait(&mut self) -> nb::Result<(), Void> {
        self.bus.borrow_mut().ticks += 1;
        Ok(())
    }
}

impl Periodic for SimTimer {}

pub type SimI2c = I2cBB<SimLine, SimLine, SimTimer>;

/// Handle to a simulated bus, used to inspect it while a driver runs
#[derive(Clone)]
pub struct Sim {
    bus: Rc<RefCell<Bus>>,
}

impl Sim {
    /// Bus with pull-ups and nothing attached
    pub fn empty() -> Self {
        let levels = Levels {
            scl: true,
            sda: true,
        };
        Sim {
            bus: Rc::new(RefCell::new(Bus {
                sda_held: false,
                scl_held: false,
                stretch_per_clock: 0,
                stretch_left: 0,
                clock_stuck: false,
                jam_after: None,
                clocks: 0,
                stretch_polls: 0,
                levels,
                trace: vec![levels],
                ticks: 0,
                device: None,
            })),
        }
    }

    /// Bus with a register-file peripheral at `address`
    pub fn with_device(address: u8) -> Self {
        let sim = Sim::empty();
        sim.bus.borrow_mut().device = Some(Device::new(address));
        sim
    }

    pub fn i2c(&self) -> SimI2c {
        self.i2c_with(Config::default())
    }

    pub fn i2c_with(&self, config: Config) -> SimI2c {
        let scl = SimLine {
            bus: self.bus.clone(),
            wire: Wire::Scl,
        };
        let sda = SimLine {
            bus: self.bus.clone(),
            wire: Wire::Sda,
        };
        let timer = SimTimer {
            bus: self.bus.clone(),
        };
        I2cBB::with_config(scl, sda, timer, config)
    }

    /// Peripheral holds SCL low for `polls` reads after every clock release
    pub fn stretch_clock(&self, polls: u32) {
        self.bus.borrow_mut().stretch_per_clock = polls;
    }

    /// Peripheral never lets SCL rise again
    pub fn jam_clock(&self) {
        let mut bus = self.bus.borrow_mut();
        bus.clock_stuck = true;
        bus.settle();
    }

    /// Peripheral lets the first `clocks` clock releases through, then jams SCL
    pub fn jam_clock_after(&self, clocks: u32) {
        let mut bus = self.bus.borrow_mut();
        bus.jam_after = Some(clocks);
        bus.clocks = 0;
    }

    pub fn register(&self, register: u8) -> u8 {
        let bus = self.bus.borrow();
        bus.device.as_ref().map_or(0, |d| d.registers[register as usize])
    }

    pub fn set_register(&self, register: u8, value: u8) {
        if let Some(device) = self.bus.borrow_mut().device.as_mut() {
            device.registers[register as usize] = value;
        }
    }

    pub fn levels(&self) -> Levels {
        self.bus.borrow().levels
    }

    pub fn ticks(&self) -> u64 {
        self.bus.borrow().ticks
    }

    pub fn stretch_polls(&self) -> u64 {
        self.bus.borrow().stretch_polls
    }

    /// Level changes so far, starting with the levels at the last reset
    pub fn trace(&self) -> Vec<Levels> {
        self.bus.borrow().trace.clone()
    }

    /// Forget recorded activity, keeping the current levels as the baseline
    pub fn reset_trace(&self) {
        let mut bus = self.bus.borrow_mut();
        let levels = bus.levels;
        bus.trace = vec![levels];
        bus.ticks = 0;
    }

    pub fn frames(&self) -> Vec<Frame> {
        decode(&self.trace())
    }

    /// Data-line level at every SCL rising edge
    pub fn clocked_bits(&self) -> Vec<bool> {
        self.trace()
            .windows(2)
            .filter(|w| !w[0].scl && w[1].scl)
            .map(|w| w[1].sda)
            .collect()
    }
}

/// Decode start/stop conditions and acknowledged bytes from a level trace
pub fn decode(trace: &[Levels]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut bits: Vec<bool> = Vec::new();

    for w in trace.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        if prev.scl && cur.scl && prev.sda != cur.sda {
            frames.push(if cur.sda { Frame::Stop } else { Frame::Start });
            bits.clear();
        } else if !prev.scl && cur.scl {
            bits.push(cur.sda);
            if bits.len() == 9 {
                let value = bits[..8]
                    .iter()
                    .fold(0u8, |acc, &bit| (acc << 1) | bit as u8);
                frames.push(Frame::Byte {
                    value,
                    ack: !bits[8],
                });
                bits.clear();
            }
        }
    }
    frames
}
