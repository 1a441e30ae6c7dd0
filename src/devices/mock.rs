//! Mock relay and meter for hardware-free testing
//!
//! Both mocks are cheap clones around shared state, so a test can hand one
//! clone to the component under test and keep another for assertions.

use super::{MeterDriver, RelayDriver};
use crate::error::{Error, Result};
use crate::types::Sample;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Scripted relay board
#[derive(Clone)]
pub struct MockRelay {
    inner: Arc<Mutex<MockRelayInner>>,
}

struct MockRelayInner {
    channels: u8,
    states: Vec<bool>,
    resets: usize,
    /// When set, the next set_channel fails with this channel's number
    fail_next_set: bool,
    /// Every (channel, on) transition in order; channel 0 = all
    history: Vec<(u8, bool)>,
}

impl MockRelay {
    /// Create a board with `channels` channels, all off
    pub fn new(channels: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockRelayInner {
                channels,
                states: vec![false; channels as usize],
                resets: 0,
                fail_next_set: false,
                history: Vec::new(),
            })),
        }
    }

    /// Make the next `set_channel` call fail (relay fault injection)
    pub fn fail_next_set(&self) {
        self.inner.lock().unwrap().fail_next_set = true;
    }

    /// Snapshot of the channel states
    pub fn states(&self) -> Vec<bool> {
        self.inner.lock().unwrap().states.clone()
    }

    /// True when no channel is on
    pub fn all_off(&self) -> bool {
        !self.inner.lock().unwrap().states.iter().any(|&s| s)
    }

    /// Number of connection resets performed
    pub fn resets(&self) -> usize {
        self.inner.lock().unwrap().resets
    }

    /// Recorded (channel, on) transitions; channel 0 = all
    pub fn history(&self) -> Vec<(u8, bool)> {
        self.inner.lock().unwrap().history.clone()
    }
}

impl RelayDriver for MockRelay {
    fn num_channels(&self) -> u8 {
        self.inner.lock().unwrap().channels
    }

    fn set_channel(&mut self, channel: u8, on: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_set {
            inner.fail_next_set = false;
            return Err(Error::InvalidChannel(channel));
        }
        if channel == 0 || channel > inner.channels {
            return Err(Error::InvalidChannel(channel));
        }
        inner.states[channel as usize - 1] = on;
        inner.history.push((channel, on));
        Ok(())
    }

    fn set_all(&mut self, on: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for state in inner.states.iter_mut() {
            *state = on;
        }
        inner.history.push((0, on));
        Ok(())
    }

    fn channel_states(&mut self) -> Result<Vec<bool>> {
        Ok(self.inner.lock().unwrap().states.clone())
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.lock().unwrap().resets += 1;
        Ok(())
    }
}

/// Scripted energy meter
#[derive(Clone)]
pub struct MockMeter {
    inner: Arc<Mutex<MockMeterInner>>,
}

struct MockMeterInner {
    /// Readings returned before falling back to the constant sample
    script: VecDeque<Result<Sample>>,
    fallback: Sample,
    reads: usize,
}

impl MockMeter {
    /// Meter reporting a constant power draw
    pub fn constant(power: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockMeterInner {
                script: VecDeque::new(),
                fallback: sample_at(power),
                reads: 0,
            })),
        }
    }

    /// Queue a scripted reading (or fault) ahead of the constant fallback
    pub fn push(&self, reading: Result<Sample>) {
        self.inner.lock().unwrap().script.push_back(reading);
    }

    /// Number of read_sample calls so far
    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().reads
    }
}

/// A plausible line sample at the given power draw
pub fn sample_at(power: f64) -> Sample {
    Sample {
        voltage: 230.0,
        current: power / 230.0,
        power,
        energy_wh: 0.0,
        frequency: 50.0,
        power_factor: 0.98,
        alarm: 0,
    }
}

impl MeterDriver for MockMeter {
    fn read_sample(&mut self) -> Result<Sample> {
        let mut inner = self.inner.lock().unwrap();
        inner.reads += 1;
        match inner.script.pop_front() {
            Some(reading) => reading,
            None => Ok(inner.fallback),
        }
    }
}
