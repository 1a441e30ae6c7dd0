//! Error types for UrjaP2P

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// UrjaP2P error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB HID error
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration serialization error
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Datagram send/bind failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Meter did not answer within the response timeout
    #[error("Meter timeout")]
    MeterTimeout,

    /// Meter answered with a malformed or exception frame
    #[error("Invalid meter response: {0}")]
    InvalidResponse(String),

    /// Modbus CRC mismatch
    #[error("Checksum error: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Expected CRC value
        expected: u16,
        /// Actual CRC value
        actual: u16,
    },

    /// Relay board not found on the USB bus
    #[error("Relay device not found (vendor {vendor_id:#06x}, product {product_id:#06x})")]
    DeviceNotFound {
        /// USB vendor id
        vendor_id: u16,
        /// USB product id
        product_id: u16,
    },

    /// Channel number outside the relay board's range
    #[error("Invalid relay channel: {0}")]
    InvalidChannel(u8),

    /// Malformed wire frame or field list
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Mutex poisoned by a panicking thread
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Meter faults are swallowed by the sampling loop and retried at the
    /// next poll period.
    pub fn is_meter_fault(&self) -> bool {
        matches!(
            self,
            Error::MeterTimeout | Error::InvalidResponse(_) | Error::ChecksumMismatch { .. }
        )
    }

    /// Relay faults are fatal to the affected session: the coordinator
    /// abandons the activation attempt and falls back to awaiting orders.
    pub fn is_relay_fault(&self) -> bool {
        matches!(
            self,
            Error::Hid(_) | Error::DeviceNotFound { .. } | Error::InvalidChannel(_)
        )
    }
}
