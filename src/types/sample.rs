//! Meter reading sample

use crate::error::{Error, Result};

/// One instantaneous meter reading
///
/// Produced once per meter poll and handed to exactly one consumer (the
/// local dump or the network sender). On the wire this is 7 `#`-joined
/// fields in declaration order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Line voltage in volts
    pub voltage: f64,
    /// Current in amps
    pub current: f64,
    /// Active power in watts
    pub power: f64,
    /// Accumulated energy reported by the meter, in watt-hours
    pub energy_wh: f64,
    /// Line frequency in hertz
    pub frequency: f64,
    /// Power factor (0.0 - 1.0)
    pub power_factor: f64,
    /// Meter alarm flags (0 = no alarm)
    pub alarm: u16,
}

/// Field count of a Sample frame
pub(crate) const SAMPLE_FIELDS: usize = 7;

impl Sample {
    /// Wire representation: 7 fields, positional
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.voltage.to_string(),
            self.current.to_string(),
            self.power.to_string(),
            self.energy_wh.to_string(),
            self.frequency.to_string(),
            self.power_factor.to_string(),
            self.alarm.to_string(),
        ]
    }

    /// Parse from decoded wire fields
    pub fn from_fields(fields: &[String]) -> Result<Self> {
        if fields.len() != SAMPLE_FIELDS {
            return Err(Error::MalformedMessage(format!(
                "sample needs {} fields, got {}",
                SAMPLE_FIELDS,
                fields.len()
            )));
        }
        let num = |i: usize| -> Result<f64> {
            fields[i]
                .parse()
                .map_err(|_| Error::MalformedMessage(format!("non-numeric field '{}'", fields[i])))
        };
        Ok(Self {
            voltage: num(0)?,
            current: num(1)?,
            power: num(2)?,
            energy_wh: num(3)?,
            frequency: num(4)?,
            power_factor: num(5)?,
            // Alarm arrives as a float string from some firmware revisions
            alarm: num(6)? as u16,
        })
    }
}
