//! Device driver traits and implementations
//!
//! Both physical collaborators sit behind `Send` traits so the trading
//! logic can run against mock devices in tests.

pub mod mock;
pub mod pzem004t;
pub mod relay;

pub use pzem004t::Pzem004t;
pub use relay::UsbHidRelay;

use crate::error::Result;
use crate::types::Sample;

/// Energy meter driver
pub trait MeterDriver: Send {
    /// Read one sample from the meter
    fn read_sample(&mut self) -> Result<Sample>;
}

/// Multi-channel relay board driver
pub trait RelayDriver: Send {
    /// Number of channels on the board
    fn num_channels(&self) -> u8;

    /// Switch one channel (1..=N) on or off
    fn set_channel(&mut self, channel: u8, on: bool) -> Result<()>;

    /// Switch all channels at once
    fn set_all(&mut self, on: bool) -> Result<()>;

    /// Current on/off state of every channel
    fn channel_states(&mut self) -> Result<Vec<bool>>;

    /// Tear down and re-acquire the device connection.
    ///
    /// The coordinator calls this before each activation instead of
    /// mutating a possibly-stale handle; there is only ever one session
    /// holding the relay at a time.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory producing a fresh meter connection per sampling session
pub type MeterFactory = Box<dyn Fn() -> Result<Box<dyn MeterDriver>> + Send>;
