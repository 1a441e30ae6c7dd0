//! Datagram networking: wire codec and UDP primitives

pub mod codec;
pub mod datagram;

pub use codec::{decode, encode, WireMessage, STOP_SENTINEL};
pub use datagram::{send, Receiver, ReceiverExit};
