//! Wire format for trade messages
//!
//! One message per datagram. A message is a positional list of string
//! fields joined with `#` and encoded as UTF-8:
//!
//! ```text
//! Order:     "1#200"
//! Sample:    "230.5#0.435#100#1543#50#0.98#0"
//! Terminate: "STOP"
//! ```
//!
//! There is no escaping: fields containing `#` are not supported. This is a
//! documented limitation of the deployed protocol, not something to fix
//! silently - both ends split on every `#`.
//!
//! Decoding failures (non-UTF-8 payloads, wrong field counts, non-numeric
//! fields) are protocol errors; receive loops drop the datagram and
//! continue.

use crate::error::{Error, Result};
use crate::types::{Order, Sample};

/// Field delimiter
const DELIMITER: char = '#';

/// Session termination sentinel: a frame whose only field is this value
pub const STOP_SENTINEL: &str = "STOP";

/// Encode a field list into a wire frame
///
/// An empty field list yields an empty frame; senders suppress those
/// rather than putting zero-byte datagrams on the wire.
pub fn encode<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let mut frame = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            frame.push(DELIMITER);
        }
        frame.push_str(field.as_ref());
    }
    frame.into_bytes()
}

/// Decode a wire frame into its field list
pub fn decode(frame: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| Error::MalformedMessage("frame is not UTF-8".to_string()))?;
    Ok(text.split(DELIMITER).map(str::to_string).collect())
}

/// Returns true for the termination sentinel: exactly one field, `"STOP"`
pub fn is_stop(fields: &[String]) -> bool {
    fields.len() == 1 && fields[0] == STOP_SENTINEL
}

/// A decoded, typed trade message
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Buyer's energy request
    Order(Order),
    /// Streamed meter reading
    Sample(Sample),
    /// Session termination
    Stop,
}

impl WireMessage {
    /// Classify a decoded field list by its shape (field count is fixed per
    /// message kind)
    pub fn parse(fields: &[String]) -> Result<Self> {
        if is_stop(fields) {
            return Ok(WireMessage::Stop);
        }
        match fields.len() {
            2 => Ok(WireMessage::Order(Order::from_fields(fields)?)),
            7 => Ok(WireMessage::Sample(Sample::from_fields(fields)?)),
            n => Err(Error::MalformedMessage(format!(
                "unrecognized field count {}",
                n
            ))),
        }
    }

    /// Wire representation of this message
    pub fn to_fields(&self) -> Vec<String> {
        match self {
            WireMessage::Order(order) => order.to_fields(),
            WireMessage::Sample(sample) => sample.to_fields(),
            WireMessage::Stop => vec![STOP_SENTINEL.to_string()],
        }
    }
}
