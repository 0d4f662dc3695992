//! Bus driver configuration

/// Behavior knobs for [`I2cBB`](crate::i2c::I2cBB)
///
/// The default reproduces the classic bit-bang initiator behavior: the
/// clock-stretch wait is unbounded and a transaction aborted by a missing
/// acknowledgment leaves the bus without a stop condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of SCL polls after releasing the clock before giving up
    /// with [`Error::StretchTimeout`](crate::i2c::Error::StretchTimeout).
    /// `None` waits forever.
    pub stretch_limit: Option<u32>,
    /// Send a stop condition before reporting
    /// [`Error::NoAck`](crate::i2c::Error::NoAck) from a transaction.
    pub stop_on_nack: bool,
}

impl Config {
    /// Default configuration
    pub const fn new() -> Self {
        Config {
            stretch_limit: None,
            stop_on_nack: false,
        }
    }

    /// Bound the clock-stretch wait to `polls` reads of SCL
    pub const fn with_stretch_limit(mut self, polls: u32) -> Self {
        self.stretch_limit = Some(polls);
        self
    }

    /// Choose whether aborted transactions release the bus with a stop condition
    pub const fn with_stop_on_nack(mut self, stop: bool) -> Self {
        self.stop_on_nack = stop;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
