//! A [bit banging] I2C initiator for microcontrollers without (or not using)
//! an I2C peripheral.
//!
//! Start and stop conditions, byte transfers and acknowledgments are
//! synthesized by holding and releasing two open-drain lines. The driver
//! supports clock stretching and implements the blocking [`embedded-hal`]
//! I2C traits, so existing device drivers can sit on top of it.
//!
//! [bit banging]: https://en.wikipedia.org/wiki/Bit_banging
//! [`embedded-hal`]: https://github.com/rust-embedded/embedded-hal

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod config;
pub mod i2c;
pub mod line;

pub use crate::config::Config;
pub use crate::i2c::{BusState, Error, I2cBB};
pub use crate::line::{BindError, Line, Mmio, OpenDrain, PortBinding, PortLine, Register};
