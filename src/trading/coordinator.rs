//! Order coordinator (seller side)
//!
//! Serves one order at a time: `Idle -> AwaitingOrder -> Activating ->
//! Delivering -> Settling -> Idle`. The single outer loop is the
//! single-order-in-flight invariant: the order port is only bound while
//! awaiting, so an order arriving mid-delivery has no listener and is
//! dropped by the network. There is no queue and no lock on the device
//! handles; each session owns them exclusively.
//!
//! Delivery runs two worker threads - the meter sampling loop and the
//! energy watcher - and rendezvouses with both before the session is
//! considered complete. A `STOP` on the reading port aborts the session; a
//! `STOP` on the order port shuts the whole serving loop down. Either way
//! every channel is deactivated before the coordinator moves on.

use crate::config::AppConfig;
use crate::devices::{MeterFactory, RelayDriver};
use crate::error::{Error, Result};
use crate::net::datagram::{Receiver, ReceiverExit};
use crate::sampler::{MeterSampler, PublishMode, SamplerHandle};
use crate::trading::watcher;
use crate::types::Order;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Outcome of one order wait
enum Awaited {
    /// A valid order arrived
    Order(Order),
    /// STOP arrived on the order port: shut the seller down
    Stopped,
    /// Daemon shutdown flag cleared
    Cancelled,
}

/// Seller-side order coordinator
pub struct OrderCoordinator {
    relay: Box<dyn RelayDriver>,
    meter_factory: MeterFactory,
    order_addr: SocketAddr,
    reading_addr: SocketAddr,
    peer_reading_addr: SocketAddr,
    meter_source: SocketAddr,
    poll_period: Duration,
    samples_per_hour: f64,
    throttle: Duration,
    settle_pause: Duration,
}

impl OrderCoordinator {
    /// Build a coordinator from configuration and opened devices
    pub fn new(
        config: &AppConfig,
        relay: Box<dyn RelayDriver>,
        meter_factory: MeterFactory,
    ) -> Result<Self> {
        Ok(Self {
            relay,
            meter_factory,
            order_addr: config.network.order_addr()?,
            reading_addr: config.network.reading_addr()?,
            peer_reading_addr: config.network.peer_reading_addr()?,
            meter_source: SocketAddr::new(
                config.network.local_ip()?,
                config.network.meter_source_port,
            ),
            poll_period: config.meter.poll_interval(),
            samples_per_hour: config.meter.samples_per_hour(),
            throttle: Duration::from_secs(config.trading.receive_throttle_secs),
            settle_pause: Duration::from_secs(config.trading.settle_pause_secs),
        })
    }

    /// Pulse channel 1 as a startup smoke test
    pub fn startup_test(&mut self) -> Result<()> {
        log::info!("relay smoke test: pulsing channel 1");
        self.relay.set_channel(1, true)?;
        thread::sleep(Duration::from_secs(2));
        self.relay.set_channel(1, false)?;
        Ok(())
    }

    /// Serve orders until a STOP arrives on the order port or `running`
    /// clears
    pub fn serve(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }

            log::info!("awaiting energy order on {}", self.order_addr);
            let order = match self.await_order(&running) {
                Ok(Awaited::Order(order)) => order,
                Ok(Awaited::Stopped) => {
                    log::info!("seller shutdown requested");
                    break;
                }
                Ok(Awaited::Cancelled) => break,
                Err(e) => {
                    // The serving loop owns its receive loop and restarts
                    // it; a transient bind or socket failure is not fatal
                    log::error!("order wait failed, retrying: {}", e);
                    self.pause(&running);
                    continue;
                }
            };

            match self.deliver(&order, &running) {
                Ok(delivered_wh) => {
                    log::info!(
                        "session complete: {:.2}Wh of {:.2}Wh via channel {}",
                        delivered_wh,
                        order.energy_wh,
                        order.channel
                    );
                }
                Err(e) => {
                    log::error!("session aborted: {}", e);
                }
            }

            // Settling: defensive deactivation of every channel, then pause
            // before the next order wait
            if let Err(e) = self.relay.set_all(false) {
                log::error!("failed to deactivate channels: {}", e);
            }
            self.pause(&running);
        }

        if let Err(e) = self.relay.set_all(false) {
            log::error!("failed to deactivate channels on shutdown: {}", e);
        }
        Ok(())
    }

    /// Block on the order port until one valid order, a STOP, or shutdown.
    ///
    /// The socket is dropped on return, leaving the order port unbound for
    /// the duration of the session (the admission gate).
    fn await_order(&self, running: &Arc<AtomicBool>) -> Result<Awaited> {
        let alive = Arc::new(AtomicBool::new(true));
        let receiver = Receiver::bind(
            self.order_addr,
            Arc::clone(running),
            Arc::clone(&alive),
            self.throttle,
        )?;

        let mut pending: Option<Order> = None;
        let exit = receiver.run(|fields| {
            match Order::from_fields(&fields) {
                Ok(order) => {
                    log::info!(
                        "order received: {:.2}Wh on channel {}",
                        order.energy_wh,
                        order.channel
                    );
                    pending = Some(order);
                    // One order per wait; end this receive loop
                    alive.store(false, Ordering::Relaxed);
                }
                Err(e) => log::warn!("dropping invalid order: {}", e),
            }
        })?;

        Ok(match (pending, exit) {
            (Some(order), _) => Awaited::Order(order),
            (None, ReceiverExit::Stopped) => Awaited::Stopped,
            (None, ReceiverExit::Cancelled) => Awaited::Cancelled,
        })
    }

    /// Run one delivery session; the ordered channel is deactivated on
    /// every exit path
    fn deliver(&mut self, order: &Order, running: &Arc<AtomicBool>) -> Result<f64> {
        // Activating: clear whatever a previous session left, reopen the
        // relay connection, then close the ordered channel
        self.relay.set_all(false)?;
        self.relay.reset()?;
        self.relay.set_channel(order.channel, true)?;
        log::info!("activated relay channel {}", order.channel);

        let result = self.run_session(order, running);

        if let Err(e) = self.relay.set_channel(order.channel, false) {
            log::error!("failed to deactivate channel {}: {}", order.channel, e);
        }
        result
    }

    /// Delivering: sampler and watcher threads, joined before returning
    fn run_session(&mut self, order: &Order, running: &Arc<AtomicBool>) -> Result<f64> {
        // Fresh meter connection per session (reset semantics)
        let meter = (self.meter_factory)()?;
        let sampler: SamplerHandle = MeterSampler::new(
            meter,
            PublishMode::Network {
                source: self.meter_source,
                targets: vec![self.reading_addr, self.peer_reading_addr],
            },
            self.poll_period,
        )
        .spawn()?;

        log::info!(
            "delivering {:.2}Wh via channel {}",
            order.energy_wh,
            order.channel
        );

        let watch_addr = self.reading_addr;
        let target_wh = order.energy_wh;
        let samples_per_hour = self.samples_per_hour;
        let throttle = self.throttle;
        let watch_running = Arc::clone(running);
        let watcher_thread = thread::Builder::new()
            .name("energy-watcher".to_string())
            .spawn(move || {
                watcher::run_watch(watch_addr, target_wh, samples_per_hour, watch_running, throttle)
            })?;

        // Rendezvous: watcher first (it decides when delivery is done),
        // then the sampler. The sampler must be stopped however the
        // watcher ended, or its thread and meter handle leak into the
        // next session.
        let join_result = watcher_thread.join();
        sampler.stop();
        let outcome = join_result
            .map_err(|_| Error::Other("energy watcher panicked".to_string()))??;

        if outcome.exit == ReceiverExit::Stopped {
            log::warn!(
                "session stopped by peer at {:.2}Wh of {:.2}Wh",
                outcome.delivered_wh,
                order.energy_wh
            );
        }
        Ok(outcome.delivered_wh)
    }

    /// Sleep out the settle pause, waking early on shutdown
    fn pause(&self, running: &Arc<AtomicBool>) {
        let deadline = std::time::Instant::now() + self.settle_pause;
        while running.load(Ordering::Relaxed) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(250));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::{MockMeter, MockRelay};
    use crate::devices::MeterDriver;
    use crate::net::{codec, datagram};
    use std::net::UdpSocket;

    /// Coordinator wired to loopback addresses and mock devices.
    ///
    /// The seller listens on 127.0.0.1, the "buyer" on 127.0.0.2, so both
    /// reading sockets can share a port number the way two hosts would.
    fn test_coordinator(relay: &MockRelay, meter: &MockMeter, base_port: u16) -> OrderCoordinator {
        let meter = meter.clone();
        OrderCoordinator {
            relay: Box::new(relay.clone()),
            meter_factory: Box::new(move || Ok(Box::new(meter.clone()) as Box<dyn MeterDriver>)),
            order_addr: format!("127.0.0.1:{}", base_port).parse().unwrap(),
            reading_addr: format!("127.0.0.1:{}", base_port + 1).parse().unwrap(),
            peer_reading_addr: format!("127.0.0.2:{}", base_port + 1).parse().unwrap(),
            meter_source: "127.0.0.1:0".parse().unwrap(),
            poll_period: Duration::from_millis(20),
            samples_per_hour: 1.0,
            throttle: Duration::ZERO,
            settle_pause: Duration::ZERO,
        }
    }

    fn send_from_buyer(target: SocketAddr, frame: &[u8]) {
        datagram::send("127.0.0.1:0".parse().unwrap(), target, frame).unwrap();
    }

    #[test]
    fn test_full_session_then_shutdown() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47320);
        let order_addr = coordinator.order_addr;
        let buyer_sink = UdpSocket::bind(coordinator.peer_reading_addr).unwrap();
        buyer_sink
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(100));
        // 200Wh at 100W and one sample per hour: two samples to complete
        send_from_buyer(order_addr, &codec::encode(&["1", "200"]));

        // The buyer's copy of the stream arrives too
        let mut buf = [0u8; 2048];
        let (n, _) = buyer_sink.recv_from(&mut buf).unwrap();
        let fields = codec::decode(&buf[..n]).unwrap();
        assert_eq!(fields.len(), 7);

        // Give the session time to finish, then shut the seller down
        std::thread::sleep(Duration::from_millis(500));
        assert!(relay.all_off(), "channel left on after session");
        let history = relay.history();
        assert!(history.contains(&(1, true)), "channel 1 never activated");
        assert!(history.contains(&(1, false)), "channel 1 never deactivated");

        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
        assert!(relay.all_off());
    }

    #[test]
    fn test_stop_mid_delivery_aborts_session() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47330);
        let order_addr = coordinator.order_addr;
        let reading_addr = coordinator.reading_addr;
        let buyer_sink = UdpSocket::bind(coordinator.peer_reading_addr).unwrap();
        buyer_sink
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(100));
        // Target far beyond what the stream will deliver
        send_from_buyer(order_addr, &codec::encode(&["2", "1000000"]));

        // Wait for delivery to start, then abort it from the buyer side
        let mut buf = [0u8; 2048];
        buyer_sink.recv_from(&mut buf).unwrap();
        assert_eq!(relay.states()[1], true, "channel 2 should be delivering");
        send_from_buyer(reading_addr, b"STOP");

        std::thread::sleep(Duration::from_millis(300));
        assert!(relay.all_off(), "channel left on after STOP abort");

        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
    }

    #[test]
    fn test_relay_fault_abandons_session() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47340);
        let order_addr = coordinator.order_addr;

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(100));
        relay.fail_next_set();
        send_from_buyer(order_addr, &codec::encode(&["1", "200"]));

        // Activation failed: no channel was ever closed, seller keeps serving
        std::thread::sleep(Duration::from_millis(300));
        assert!(relay.all_off());
        assert!(!relay.history().contains(&(1, true)));

        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
    }

    #[test]
    fn test_transient_bind_failure_retries() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47370);
        let order_addr = coordinator.order_addr;
        // Another process holds the order port when serving starts
        let blocker = UdpSocket::bind(order_addr).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(200));
        assert!(
            !serve.is_finished(),
            "seller exited on a transient bind failure"
        );

        // Port freed: the next retry binds and serving resumes
        drop(blocker);
        std::thread::sleep(Duration::from_millis(300));
        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
    }

    #[test]
    fn test_sampler_stopped_when_watcher_fails() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47380);
        let order_addr = coordinator.order_addr;
        // Occupying the reading port makes the watcher's bind fail as soon
        // as delivery starts
        let _blocker = UdpSocket::bind(coordinator.reading_addr).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(100));
        send_from_buyer(order_addr, &codec::encode(&["1", "200"]));

        // Session aborts; the sampler thread must not outlive it
        std::thread::sleep(Duration::from_millis(300));
        assert!(relay.all_off(), "channel left on after aborted session");
        let reads_after_abort = meter.reads();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(
            meter.reads(),
            reads_after_abort,
            "sampler still polling after the session ended"
        );

        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
    }

    #[test]
    fn test_invalid_order_dropped_and_serving_continues() {
        let relay = MockRelay::new(4);
        let meter = MockMeter::constant(100.0);
        let mut coordinator = test_coordinator(&relay, &meter, 47350);
        let order_addr = coordinator.order_addr;

        let running = Arc::new(AtomicBool::new(true));
        let serve_running = Arc::clone(&running);
        let serve = std::thread::spawn(move || coordinator.serve(serve_running));

        std::thread::sleep(Duration::from_millis(100));
        // Channel 0 is reserved for direct control, not orders
        send_from_buyer(order_addr, &codec::encode(&["0", "200"]));
        std::thread::sleep(Duration::from_millis(200));
        assert!(relay.history().is_empty(), "invalid order reached the relay");

        send_from_buyer(order_addr, b"STOP");
        serve.join().unwrap().unwrap();
    }
}
