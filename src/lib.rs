//! UrjaP2P - peer-to-peer energy trading over relay-switched lines
//!
//! A buyer node orders a quantity of energy on one relay channel; a seller
//! node closes that channel, streams meter readings over UDP, and both
//! sides independently integrate delivered energy to decide when the trade
//! is done.
//!
//! ## Crate layout
//!
//! - [`net`]: the `#`-delimited wire codec and UDP send/receive primitives
//! - [`devices`]: relay board and energy meter behind `Send` traits, with
//!   mocks for hardware-free testing
//! - [`sampler`]: the periodic meter sampling loop
//! - [`trading`]: order coordinator (seller), order placer (buyer) and the
//!   shared energy watcher

pub mod config;
pub mod devices;
pub mod error;
pub mod net;
pub mod sampler;
pub mod trading;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{Error, Result};
