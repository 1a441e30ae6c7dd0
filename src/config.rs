//! Configuration for the UrjaP2P daemon
//!
//! Loads configuration from a TOML file. Every component receives its
//! parameters at construction; there are no process-wide constants.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub meter: MeterConfig,
    pub relay: RelayConfig,
    pub trading: TradingConfig,
    pub logging: LoggingConfig,
}

/// UDP addressing configuration
///
/// A node that both sends and receives must use distinct local ports for the
/// two roles: `send` binds a fresh one-shot socket per datagram while the
/// receive loops hold their port for the whole session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Local IPv4 address, or `"auto"` to detect via a throwaway UDP connect
    pub local_ip: String,
    /// Remote peer IPv4 address (the other party of the trade)
    pub peer_ip: String,
    /// Port the seller listens on for Order datagrams
    pub order_port: u16,
    /// Port Sample datagrams are delivered to (same number on both hosts)
    pub reading_port: u16,
    /// Source port for Sample datagrams sent by the sampling loop
    pub meter_source_port: u16,
    /// Source port for Order/STOP datagrams sent by the buyer
    pub order_source_port: u16,
}

impl NetworkConfig {
    /// Resolve the local IPv4 address, auto-detecting if configured as `"auto"`
    pub fn local_ip(&self) -> Result<IpAddr> {
        resolve_ip(&self.local_ip)
    }

    /// Resolve the peer IPv4 address
    pub fn peer_ip(&self) -> Result<IpAddr> {
        resolve_ip(&self.peer_ip)
    }

    /// Local address the seller's order receive loop binds to
    pub fn order_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.local_ip()?, self.order_port))
    }

    /// Local address a reading receive loop binds to
    pub fn reading_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.local_ip()?, self.reading_port))
    }

    /// Peer's reading address (where streamed samples are sent)
    pub fn peer_reading_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.peer_ip()?, self.reading_port))
    }

    /// Peer's order address (where the buyer sends its Order)
    pub fn peer_order_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.peer_ip()?, self.order_port))
    }
}

/// Energy meter configuration (PZEM-004T over Modbus RTU)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeterConfig {
    /// Serial port path (e.g. `/dev/ttyS0`)
    pub port: String,
    /// Baud rate (PZEM-004T is fixed at 9600 8N1)
    pub baud_rate: u32,
    /// Modbus slave address
    pub slave_id: u8,
    /// Response timeout in milliseconds
    pub timeout_ms: u64,
    /// Seconds between meter polls
    pub poll_interval_secs: u64,
    /// Calibration divisor applied to the raw power register pair.
    ///
    /// Measured empirically against a reference load; the stock register
    /// scaling would be 10.0 but deployed boards read high.
    pub power_scale: f64,
}

impl MeterConfig {
    /// Poll period as a `Duration`
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    /// Samples per hour at the configured cadence; divides instantaneous
    /// watts into watt-hours per sample.
    pub fn samples_per_hour(&self) -> f64 {
        3600.0 / self.poll_interval_secs as f64
    }
}

/// USB HID relay board configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Number of channels on the board
    pub channels: u8,
    /// Pulse channel 1 on/off at seller startup as a smoke test
    pub startup_test: bool,
}

/// Trading behaviour configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    /// Pause after each completed or aborted session before the seller
    /// re-enters its order wait
    pub settle_pause_secs: u64,
    /// Delay after each dispatched datagram in a receive loop. Pacing
    /// inherited from the field deployment; tunable, not load-bearing.
    pub receive_throttle_secs: u64,
    /// Destination for the buyer's final STOP datagram, `"ip:port"`.
    /// Empty string means the peer's reading address (aborts the seller's
    /// in-flight watcher without shutting the seller down).
    pub stop_address: String,
}

impl TradingConfig {
    /// Resolve the buyer's STOP destination, falling back to the peer's
    /// reading address when unset
    pub fn stop_addr(&self, network: &NetworkConfig) -> Result<SocketAddr> {
        if self.stop_address.is_empty() {
            return network.peer_reading_addr();
        }
        self.stop_address
            .parse()
            .map_err(|e| crate::error::Error::Other(format!("bad stop_address: {}", e)))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run
    fn validate(&self) -> Result<()> {
        if self.meter.poll_interval_secs == 0 {
            return Err(crate::error::Error::Other(
                "meter.poll_interval_secs must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to TOML file (used to write a starter template)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration matching the reference field deployment.
    ///
    /// Suitable for loopback testing (both roles on one host). Production
    /// deployments should use a proper TOML configuration file with
    /// `peer_ip` pointing at the other party.
    pub fn field_defaults() -> Self {
        Self {
            network: NetworkConfig {
                local_ip: "auto".to_string(),
                peer_ip: "auto".to_string(),
                order_port: 2202,
                reading_port: 2201,
                meter_source_port: 7711,
                order_source_port: 8484,
            },
            meter: MeterConfig {
                port: "/dev/ttyS0".to_string(),
                baud_rate: 9600,
                slave_id: 1,
                timeout_ms: 2000,
                poll_interval_secs: 15,
                power_scale: 9.8,
            },
            relay: RelayConfig {
                vendor_id: 0x16c0,
                product_id: 0x05df,
                channels: 4,
                startup_test: false,
            },
            trading: TradingConfig {
                settle_pause_secs: 60,
                receive_throttle_secs: 2,
                stop_address: String::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::field_defaults()
    }
}

/// Resolve an address string, auto-detecting the primary local IPv4 address
/// when given `"auto"`.
///
/// Detection connects a throwaway UDP socket to a public address; no packet
/// is sent, the OS just picks the outbound interface.
fn resolve_ip(s: &str) -> Result<IpAddr> {
    if s != "auto" {
        return s
            .parse()
            .map_err(|e| crate::error::Error::Other(format!("bad address '{}': {}", s, e)));
    }
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::field_defaults();
        assert_eq!(config.network.order_port, 2202);
        assert_eq!(config.network.reading_port, 2201);
        assert_eq!(config.meter.poll_interval_secs, 15);
        assert_eq!(config.meter.power_scale, 9.8);
        assert_eq!(config.relay.channels, 4);
        assert_eq!(config.trading.settle_pause_secs, 60);
    }

    #[test]
    fn test_samples_per_hour() {
        let mut meter = AppConfig::field_defaults().meter;
        assert_eq!(meter.samples_per_hour(), 240.0);
        meter.poll_interval_secs = 3600;
        assert_eq!(meter.samples_per_hour(), 1.0);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::field_defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[network]"));
        assert!(toml_string.contains("[meter]"));
        assert!(toml_string.contains("[relay]"));
        assert!(toml_string.contains("[trading]"));
        assert!(toml_string.contains("order_port = 2202"));

        let parsed: AppConfig = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.network.order_port, config.network.order_port);
        assert_eq!(parsed.meter.power_scale, config.meter.power_scale);
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[network]
local_ip = "10.64.194.14"
peer_ip = "10.64.194.15"
order_port = 3302
reading_port = 3301
meter_source_port = 7711
order_source_port = 8484

[meter]
port = "/dev/ttyUSB0"
baud_rate = 9600
slave_id = 1
timeout_ms = 1500
poll_interval_secs = 30
power_scale = 10.0

[relay]
vendor_id = 5824
product_id = 1503
channels = 8
startup_test = true

[trading]
settle_pause_secs = 10
receive_throttle_secs = 0
stop_address = "10.64.194.15:2202"

[logging]
level = "debug"
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.network.local_ip, "10.64.194.14");
        assert_eq!(config.network.order_port, 3302);
        assert_eq!(config.meter.poll_interval_secs, 30);
        assert_eq!(config.relay.channels, 8);
        assert!(config.relay.startup_test);
        let stop = config.trading.stop_addr(&config.network).unwrap();
        assert_eq!(stop.port(), 2202);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        // A zero cadence would make samples_per_hour infinite and every
        // watcher accumulate zero per sample
        let mut config = AppConfig::field_defaults();
        config.meter.poll_interval_secs = 0;
        assert!(config.validate().is_err());
        assert!(AppConfig::field_defaults().validate().is_ok());
    }

    #[test]
    fn test_stop_addr_falls_back_to_peer_reading() {
        let mut config = AppConfig::field_defaults();
        config.network.peer_ip = "10.0.0.7".to_string();
        let stop = config.trading.stop_addr(&config.network).unwrap();
        assert_eq!(stop, "10.0.0.7:2201".parse().unwrap());
    }
}
