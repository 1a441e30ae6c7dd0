//! Energy order placed by a buyer

use crate::error::{Error, Result};

/// A buyer's request for a quantity of energy on one relay channel
///
/// Consumed exactly once by the seller's coordinator. Channel 0 ("all
/// channels") is only meaningful for direct relay control and is rejected
/// as an order target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Order {
    /// Relay channel to deliver on (1..=N)
    pub channel: u8,
    /// Requested energy in watt-hours
    pub energy_wh: f64,
}

/// Field count of an Order frame
pub(crate) const ORDER_FIELDS: usize = 2;

impl Order {
    /// Create an order, rejecting the reserved channel 0
    pub fn new(channel: u8, energy_wh: f64) -> Result<Self> {
        if channel == 0 {
            return Err(Error::InvalidChannel(0));
        }
        Ok(Self { channel, energy_wh })
    }

    /// Wire representation: channel, energy
    pub fn to_fields(&self) -> Vec<String> {
        vec![self.channel.to_string(), self.energy_wh.to_string()]
    }

    /// Parse from decoded wire fields
    pub fn from_fields(fields: &[String]) -> Result<Self> {
        if fields.len() != ORDER_FIELDS {
            return Err(Error::MalformedMessage(format!(
                "order needs {} fields, got {}",
                ORDER_FIELDS,
                fields.len()
            )));
        }
        let channel: u8 = fields[0]
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("bad channel '{}'", fields[0])))?;
        let energy_wh: f64 = fields[1]
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("bad energy '{}'", fields[1])))?;
        Self::new(channel, energy_wh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let order = Order::new(1, 200.0).unwrap();
        let parsed = Order::from_fields(&order.to_fields()).unwrap();
        assert_eq!(parsed, order);
    }

    #[test]
    fn test_channel_zero_rejected() {
        assert!(Order::new(0, 100.0).is_err());
        let fields = vec!["0".to_string(), "100".to_string()];
        assert!(Order::from_fields(&fields).is_err());
    }

    #[test]
    fn test_malformed_fields_rejected() {
        let fields = vec!["one".to_string(), "100".to_string()];
        assert!(Order::from_fields(&fields).is_err());
        let fields = vec!["1".to_string()];
        assert!(Order::from_fields(&fields).is_err());
    }
}
