//! Energy watcher: reconciles the streamed metering signal against a target
//!
//! The accumulation rule is the same on both sides of a trade: each sample's
//! instantaneous power is integrated over one sampling interval,
//! `delivered += power / (3600 / period_secs)`, i.e. watt to watt-hour at
//! the fixed metering cadence. Samples are consumed strictly in arrival
//! order by a single thread; a lost datagram delays accumulation but never
//! corrupts it, because energy is only added on receipt.

use crate::error::Result;
use crate::net::datagram::{Receiver, ReceiverExit};
use crate::types::Sample;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Accumulates delivered energy toward a target
#[derive(Debug, Clone)]
pub struct EnergyWatcher {
    target_wh: f64,
    delivered_wh: f64,
    samples_per_hour: f64,
}

impl EnergyWatcher {
    /// Watch for `target_wh` watt-hours at the given metering cadence
    pub fn new(target_wh: f64, samples_per_hour: f64) -> Self {
        Self {
            target_wh,
            delivered_wh: 0.0,
            samples_per_hour,
        }
    }

    /// Integrate one sample; returns true once the target is met
    pub fn on_sample(&mut self, sample: &Sample) -> bool {
        self.delivered_wh += sample.power / self.samples_per_hour;
        self.is_complete()
    }

    /// Energy accumulated so far (monotonically non-decreasing)
    pub fn delivered_wh(&self) -> f64 {
        self.delivered_wh
    }

    /// True once delivered energy reached the target
    pub fn is_complete(&self) -> bool {
        self.delivered_wh >= self.target_wh
    }
}

/// Result of a completed watch loop
#[derive(Debug, Clone, Copy)]
pub struct WatchOutcome {
    /// Total energy accumulated when the loop ended
    pub delivered_wh: f64,
    /// Whether the target was met (false on STOP or shutdown)
    pub completed: bool,
    /// How the underlying receive loop ended
    pub exit: ReceiverExit,
}

/// Run a watch loop on `local`, consuming streamed samples until the target
/// is met, a STOP arrives, or `running` clears.
///
/// On target completion the loop cancels itself via its alive flag.
/// Malformed datagrams are dropped with the accumulator untouched.
pub fn run_watch(
    local: SocketAddr,
    target_wh: f64,
    samples_per_hour: f64,
    running: Arc<AtomicBool>,
    throttle: Duration,
) -> Result<WatchOutcome> {
    let alive = Arc::new(AtomicBool::new(true));
    let receiver = Receiver::bind(local, running, Arc::clone(&alive), throttle)?;
    watch(receiver, alive, target_wh, samples_per_hour)
}

/// Drive an already-bound receiver to completion.
///
/// `alive` must be the flag the receiver was bound with; completion is
/// signalled by clearing it.
pub(crate) fn watch(
    receiver: Receiver,
    alive: Arc<AtomicBool>,
    target_wh: f64,
    samples_per_hour: f64,
) -> Result<WatchOutcome> {
    let mut watcher = EnergyWatcher::new(target_wh, samples_per_hour);
    let exit = receiver.run(|fields| {
        let sample = match Sample::from_fields(&fields) {
            Ok(sample) => sample,
            Err(e) => {
                log::debug!("dropping malformed sample: {}", e);
                return;
            }
        };
        let done = watcher.on_sample(&sample);
        log::info!(
            "energy delivered: {:.2}Wh of {:.2}Wh",
            watcher.delivered_wh(),
            target_wh
        );
        if done {
            log::info!("energy target met, ending watch");
            alive.store(false, Ordering::Relaxed);
        }
    })?;

    Ok(WatchOutcome {
        delivered_wh: watcher.delivered_wh(),
        completed: watcher.is_complete(),
        exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::sample_at;
    use crate::net::{codec, datagram};

    #[test]
    fn test_terminates_after_exact_sample_count() {
        // ceil(target * samples_per_hour / power) samples, never earlier
        let cases = [
            (200.0, 1.0, 100.0, 2),
            (250.0, 1.0, 100.0, 3),
            (1.0, 240.0, 60.0, 4), // 15s cadence, 60W: 0.25Wh per sample
        ];
        for (target, sph, power, expected) in cases {
            let mut watcher = EnergyWatcher::new(target, sph);
            let mut count = 0;
            while !watcher.on_sample(&sample_at(power)) {
                count += 1;
                assert!(count < 1000, "watcher never completed");
            }
            assert_eq!(count + 1, expected, "target {} at {}W", target, power);
        }
    }

    #[test]
    fn test_accumulation_independent_of_losses() {
        // n-k received samples at constant power accumulate the same energy
        // no matter which k were dropped
        let received = 7; // 10 sent, 3 lost
        let mut watcher = EnergyWatcher::new(f64::MAX, 240.0);
        for _ in 0..received {
            watcher.on_sample(&sample_at(120.0));
        }
        let expected = received as f64 * 120.0 / 240.0;
        assert!((watcher.delivered_wh() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_scenario_a_two_cycles_at_half_target_power() {
        // Order of 200Wh, constant 100W at one sample per hour
        let mut watcher = EnergyWatcher::new(200.0, 1.0);
        assert!(!watcher.on_sample(&sample_at(100.0)));
        assert!(watcher.on_sample(&sample_at(100.0)));
        assert_eq!(watcher.delivered_wh(), 200.0);
    }

    /// Bind a watch loop on an ephemeral port and spawn it, returning the
    /// resolved address to stream samples at
    fn spawn_watch(
        target_wh: f64,
    ) -> (SocketAddr, std::thread::JoinHandle<Result<WatchOutcome>>) {
        let running = Arc::new(AtomicBool::new(true));
        let alive = Arc::new(AtomicBool::new(true));
        let receiver = Receiver::bind(
            "127.0.0.1:0".parse().unwrap(),
            running,
            Arc::clone(&alive),
            Duration::ZERO,
        )
        .unwrap();
        let addr = receiver.local_addr().unwrap();
        let handle = std::thread::spawn(move || watch(receiver, alive, target_wh, 1.0));
        (addr, handle)
    }

    fn send_to(target: SocketAddr, frame: &[u8]) {
        datagram::send("127.0.0.1:0".parse().unwrap(), target, frame).unwrap();
    }

    #[test]
    fn test_watch_self_cancels_on_target() {
        let (addr, handle) = spawn_watch(200.0);

        let frame = codec::encode(&sample_at(100.0).to_fields());
        send_to(addr, &frame);
        send_to(addr, &frame);

        let outcome = handle.join().unwrap().unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.exit, ReceiverExit::Cancelled);
        assert_eq!(outcome.delivered_wh, 200.0);
    }

    #[test]
    fn test_watch_aborts_on_stop_regardless_of_progress() {
        let (addr, handle) = spawn_watch(1_000_000.0);

        send_to(addr, &codec::encode(&sample_at(100.0).to_fields()));
        send_to(addr, b"STOP");

        let outcome = handle.join().unwrap().unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.exit, ReceiverExit::Stopped);
        assert_eq!(outcome.delivered_wh, 100.0);
    }

    #[test]
    fn test_watch_drops_malformed_sample() {
        let (addr, handle) = spawn_watch(200.0);

        send_to(addr, &codec::encode(&sample_at(100.0).to_fields()));
        // Non-numeric power field: dropped, accumulator untouched
        send_to(addr, b"230#0.4#watts#0#50#0.9#0");
        send_to(addr, b"STOP");

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.delivered_wh, 100.0);
        assert!(!outcome.completed);
    }
}
