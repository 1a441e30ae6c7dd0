//! Order placer (buyer side)
//!
//! A single linear sequence, no state machine: bind the reading socket,
//! send the order, watch the incoming sample stream until the requested
//! energy arrived (the same accumulation rule the seller applies), then
//! send a final `STOP`.
//!
//! The STOP destination is an explicit parameter rather than an assumption:
//! by default it goes to the seller's reading port, which ends the seller's
//! in-flight watcher if the buyer finishes first but leaves the seller
//! serving. Pointing it at the seller's order port requests a full seller
//! shutdown instead.

use crate::config::AppConfig;
use crate::error::Result;
use crate::net::datagram::Receiver;
use crate::net::{codec, datagram};
use crate::trading::watcher::{self, WatchOutcome};
use crate::types::Order;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Buyer-side order placer
pub struct OrderPlacer {
    source: SocketAddr,
    seller_order_addr: SocketAddr,
    reading_addr: SocketAddr,
    stop_addr: SocketAddr,
    samples_per_hour: f64,
    throttle: Duration,
}

impl OrderPlacer {
    /// Build a placer from configuration
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            source: SocketAddr::new(
                config.network.local_ip()?,
                config.network.order_source_port,
            ),
            seller_order_addr: config.network.peer_order_addr()?,
            reading_addr: config.network.reading_addr()?,
            stop_addr: config.trading.stop_addr(&config.network)?,
            samples_per_hour: config.meter.samples_per_hour(),
            throttle: Duration::from_secs(config.trading.receive_throttle_secs),
        })
    }

    /// Place one order and track its delivery to completion
    pub fn run(&self, order: Order, running: Arc<AtomicBool>) -> Result<WatchOutcome> {
        // Bind the reading socket before the order goes out, so the first
        // streamed sample cannot race the bind
        let alive = Arc::new(AtomicBool::new(true));
        let receiver = Receiver::bind(
            self.reading_addr,
            running,
            Arc::clone(&alive),
            self.throttle,
        )?;
        self.run_on(receiver, alive, order)
    }

    fn run_on(
        &self,
        receiver: Receiver,
        alive: Arc<AtomicBool>,
        order: Order,
    ) -> Result<WatchOutcome> {
        log::info!(
            "placing order: {:.2}Wh on channel {} -> {}",
            order.energy_wh,
            order.channel,
            self.seller_order_addr
        );
        datagram::send(
            self.source,
            self.seller_order_addr,
            &codec::encode(&order.to_fields()),
        )?;

        let outcome = watcher::watch(receiver, alive, order.energy_wh, self.samples_per_hour)?;

        if outcome.completed {
            log::info!("order fulfilled: {:.2}Wh received", outcome.delivered_wh);
        } else {
            log::warn!(
                "order ended early at {:.2}Wh of {:.2}Wh",
                outcome.delivered_wh,
                order.energy_wh
            );
        }

        let stop = codec::encode(&[codec::STOP_SENTINEL]);
        if let Err(e) = datagram::send(self.source, self.stop_addr, &stop) {
            log::warn!("failed to send STOP to {}: {}", self.stop_addr, e);
        }

        Ok(outcome)
    }
}
