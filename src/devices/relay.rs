//! USB HID relay board driver
//!
//! Driver for the driver-less V-USB relay boards (dcttech style). Control
//! goes over HID feature reports:
//!
//! | Report          | Effect            |
//! |-----------------|-------------------|
//! | `[0xFF, n]`     | channel n on      |
//! | `[0xFD, n]`     | channel n off     |
//! | `[0xFE]`        | all channels on   |
//! | `[0xFC]`        | all channels off  |
//!
//! State readback is the last byte of an 8-byte feature report: bit i set
//! means channel i+1 is closed.

use super::RelayDriver;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use hidapi::{HidApi, HidDevice};

const CMD_ONE_ON: u8 = 0xFF;
const CMD_ONE_OFF: u8 = 0xFD;
const CMD_ALL_ON: u8 = 0xFE;
const CMD_ALL_OFF: u8 = 0xFC;

/// Status report length (unique id in bytes 0-4, states in the last byte)
const REPORT_LEN: usize = 9;

/// USB HID relay board
pub struct UsbHidRelay {
    device: HidDevice,
    config: RelayConfig,
}

impl UsbHidRelay {
    /// Open the relay board described by `config`
    ///
    /// Failure at this point is a configuration-time fault and aborts
    /// process start.
    pub fn open(config: &RelayConfig) -> Result<Self> {
        let api = HidApi::new()?;
        let device = api
            .open(config.vendor_id, config.product_id)
            .map_err(|_| Error::DeviceNotFound {
                vendor_id: config.vendor_id,
                product_id: config.product_id,
            })?;
        log::info!(
            "Opened relay board {:#06x}:{:#06x} ({} channels)",
            config.vendor_id,
            config.product_id,
            config.channels
        );
        Ok(Self {
            device,
            config: config.clone(),
        })
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if channel == 0 || channel > self.config.channels {
            return Err(Error::InvalidChannel(channel));
        }
        Ok(())
    }

    fn send_command(&self, payload: &[u8]) -> Result<()> {
        // Byte 0 is the HID report number
        let mut report = vec![0u8];
        report.extend_from_slice(payload);
        self.device.send_feature_report(&report)?;
        Ok(())
    }
}

/// Decode the board's status byte into per-channel states
///
/// The byte reads right-to-left: bit 0 is channel 1.
pub(crate) fn states_from_report_byte(byte: u8, channels: u8) -> Vec<bool> {
    (0..channels).map(|i| byte & (1 << i) != 0).collect()
}

impl RelayDriver for UsbHidRelay {
    fn num_channels(&self) -> u8 {
        self.config.channels
    }

    fn set_channel(&mut self, channel: u8, on: bool) -> Result<()> {
        self.check_channel(channel)?;
        let cmd = if on { CMD_ONE_ON } else { CMD_ONE_OFF };
        self.send_command(&[cmd, channel])?;
        log::debug!("relay channel {} -> {}", channel, if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn set_all(&mut self, on: bool) -> Result<()> {
        let cmd = if on { CMD_ALL_ON } else { CMD_ALL_OFF };
        self.send_command(&[cmd])?;
        log::debug!("all relay channels -> {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    fn channel_states(&mut self) -> Result<Vec<bool>> {
        let mut report = [0u8; REPORT_LEN];
        report[0] = 0x01;
        let n = self.device.get_feature_report(&mut report)?;
        if n == 0 {
            return Err(Error::InvalidResponse("empty relay status report".to_string()));
        }
        Ok(states_from_report_byte(report[n - 1], self.config.channels))
    }

    fn reset(&mut self) -> Result<()> {
        let api = HidApi::new()?;
        self.device = api
            .open(self.config.vendor_id, self.config.product_id)
            .map_err(|_| Error::DeviceNotFound {
                vendor_id: self.config.vendor_id,
                product_id: self.config.product_id,
            })?;
        log::debug!("relay connection reopened");
        Ok(())
    }
}
