//! Meter sampling loop
//!
//! Pulls one [`Sample`] from the meter on a fixed period and publishes it,
//! either as a human-readable dump (local mode) or as one datagram per
//! configured target (network mode).
//!
//! Each session gets a fresh sampler with a fresh meter connection, so a
//! restart always reinitializes the bus. The loop owns its meter handle and
//! releases it on exit, whichever way the loop ends.
//!
//! Failure policy for an unattended field device: meter faults (timeout,
//! bad frame, bad checksum) are expected on a noisy bus and retried at the
//! next period; anything else is logged and the loop keeps going. Nothing
//! read-side ever kills the loop.

use crate::devices::MeterDriver;
use crate::net::{codec, datagram};
use crate::types::Sample;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where samples go
pub enum PublishMode {
    /// Dump readings to the operator log
    Local,
    /// Stream readings as datagrams, one per target per poll
    Network {
        /// Source address for the one-shot send sockets
        source: SocketAddr,
        /// Every consumer of the stream (fan-out)
        targets: Vec<SocketAddr>,
    },
}

/// A meter sampling loop, ready to spawn
pub struct MeterSampler {
    meter: Box<dyn MeterDriver>,
    mode: PublishMode,
    period: Duration,
}

/// Running sampler thread; dropping it without [`stop`](SamplerHandle::stop)
/// detaches the loop until its next period check
pub struct SamplerHandle {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

impl SamplerHandle {
    /// Signal the loop to stop and wait for it to exit
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.join.join().is_err() {
            log::error!("sampler thread panicked");
        }
    }
}

impl MeterSampler {
    /// Create a sampling loop over an open meter connection
    pub fn new(meter: Box<dyn MeterDriver>, mode: PublishMode, period: Duration) -> Self {
        Self {
            meter,
            mode,
            period,
        }
    }

    /// Start the loop on its own thread
    pub fn spawn(self) -> std::io::Result<SamplerHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = thread::Builder::new()
            .name("meter-sampler".to_string())
            .spawn(move || self.run(stop_rx))?;
        Ok(SamplerHandle { stop_tx, join })
    }

    fn run(mut self, stop_rx: crossbeam_channel::Receiver<()>) {
        log::info!("meter sampling loop started (period {:?})", self.period);

        loop {
            match self.meter.read_sample() {
                Ok(sample) => self.publish(&sample),
                Err(e) if e.is_meter_fault() => {
                    log::debug!("meter fault, retrying next period: {}", e);
                }
                Err(e) => {
                    log::warn!("unexpected meter error: {}", e);
                }
            }

            // The stop wait doubles as the inter-poll sleep, so stop takes
            // effect without waiting out a full period
            match stop_rx.recv_timeout(self.period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        log::info!("meter sampling loop stopped");
    }

    fn publish(&self, sample: &Sample) {
        match &self.mode {
            PublishMode::Local => {
                log::info!(
                    "V: {:.1}V  I: {:.3}A  P: {:.1}W  E: {:.0}Wh  f: {:.1}Hz  pf: {:.2}  alarm: {}",
                    sample.voltage,
                    sample.current,
                    sample.power,
                    sample.energy_wh,
                    sample.frequency,
                    sample.power_factor,
                    sample.alarm
                );
            }
            PublishMode::Network { source, targets } => {
                let frame = codec::encode(&sample.to_fields());
                for target in targets {
                    if let Err(e) = datagram::send(*source, *target, &frame) {
                        // Lost readings only delay accumulation; not fatal
                        log::warn!("failed to send reading to {}: {}", target, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::MockMeter;
    use crate::error::Error;
    use crate::types::Sample;
    use std::net::UdpSocket;

    fn recv_fields(socket: &UdpSocket) -> Vec<String> {
        let mut buf = [0u8; 2048];
        let (n, _) = socket.recv_from(&mut buf).expect("no datagram arrived");
        codec::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn test_network_mode_streams_to_all_targets() {
        let sink_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        for sink in [&sink_a, &sink_b] {
            sink.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }

        let meter = MockMeter::constant(100.0);
        let sampler = MeterSampler::new(
            Box::new(meter.clone()),
            PublishMode::Network {
                source: "127.0.0.1:0".parse().unwrap(),
                targets: vec![
                    sink_a.local_addr().unwrap(),
                    sink_b.local_addr().unwrap(),
                ],
            },
            Duration::from_millis(10),
        );
        let handle = sampler.spawn().unwrap();

        let sample_a = Sample::from_fields(&recv_fields(&sink_a)).unwrap();
        let sample_b = Sample::from_fields(&recv_fields(&sink_b)).unwrap();
        assert_eq!(sample_a.power, 100.0);
        assert_eq!(sample_b.power, 100.0);

        handle.stop();
        assert!(meter.reads() >= 1);
    }

    #[test]
    fn test_meter_faults_do_not_kill_loop() {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let meter = MockMeter::constant(50.0);
        meter.push(Err(Error::MeterTimeout));
        meter.push(Err(Error::InvalidResponse("garbled".into())));

        let sampler = MeterSampler::new(
            Box::new(meter.clone()),
            PublishMode::Network {
                source: "127.0.0.1:0".parse().unwrap(),
                targets: vec![sink.local_addr().unwrap()],
            },
            Duration::from_millis(5),
        );
        let handle = sampler.spawn().unwrap();

        // Two faulted polls are swallowed before this reading arrives
        let sample = Sample::from_fields(&recv_fields(&sink)).unwrap();
        assert_eq!(sample.power, 50.0);

        handle.stop();
        assert!(meter.reads() >= 3);
    }

    #[test]
    fn test_stop_ends_loop_promptly() {
        let meter = MockMeter::constant(10.0);
        let sampler = MeterSampler::new(
            Box::new(meter),
            PublishMode::Local,
            Duration::from_secs(3600),
        );
        let handle = sampler.spawn().unwrap();
        // Returns without waiting out the hour-long period
        handle.stop();
    }
}
