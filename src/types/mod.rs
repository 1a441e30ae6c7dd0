//! Value types for trades and meter readings

mod order;
mod sample;

pub use order::Order;
pub use sample::Sample;
